//! Router Metrics
//!
//! Counters, gauges and latency histograms for the routing engine:
//! - Plans served and failed
//! - Failover runs, fallbacks, last-resort calls and cancellations
//! - Per-provider calls, outcomes, breaker rejections and transitions
//! - Current breaker phase per provider
//!
//! `RouterMetrics` implements [`BreakerObserver`] so the breaker bank reports
//! transitions and rejections directly. Export is pull-based through
//! [`RouterMetrics::to_prometheus`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use super::breaker::{BreakerObserver, BreakerPhase, BreakerTransition};

// ============================================================================
// Histogram
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default provider latency buckets in milliseconds
    pub fn latency_default() -> Self {
        Self::new(vec![
            50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value.max(0.0) as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 { sum as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Bucket bound at or above the given quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can be set
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

/// Metrics for a single provider
#[derive(Debug)]
pub struct ProviderMetrics {
    pub provider: String,
    /// Calls actually dispatched
    pub calls: Counter,
    pub successes: Counter,
    pub failures: Counter,
    /// Calls denied by the breaker
    pub rejected: Counter,
    pub opened: Counter,
    pub half_opened: Counter,
    pub closed: Counter,
    /// Current phase, see [`BreakerPhase::gauge_value`]
    pub phase: Gauge,
    pub latency: Histogram,
}

impl ProviderMetrics {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            calls: Counter::new(),
            successes: Counter::new(),
            failures: Counter::new(),
            rejected: Counter::new(),
            opened: Counter::new(),
            half_opened: Counter::new(),
            closed: Counter::new(),
            phase: Gauge::new(),
            latency: Histogram::latency_default(),
        }
    }

    pub fn summary(&self) -> ProviderMetricsSummary {
        let latency = self.latency.snapshot();
        ProviderMetricsSummary {
            provider: self.provider.clone(),
            calls: self.calls.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            rejected: self.rejected.get(),
            transitions_open: self.opened.get(),
            transitions_half_open: self.half_opened.get(),
            transitions_closed: self.closed.get(),
            phase: self.phase.get(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
        }
    }
}

/// Summary of one provider's metrics
#[derive(Clone, Debug, Serialize)]
pub struct ProviderMetricsSummary {
    pub provider: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub transitions_open: u64,
    pub transitions_half_open: u64,
    pub transitions_closed: u64,
    pub phase: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_mean_ms: f64,
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Centralized metrics for the routing engine
#[derive(Debug)]
pub struct RouterMetrics {
    providers: DashMap<String, Arc<ProviderMetrics>>,

    pub plans: Counter,
    pub plan_failures: Counter,
    pub failover_runs: Counter,
    pub failover_successes: Counter,
    pub fallbacks: Counter,
    pub last_resort_calls: Counter,
    pub cancellations: Counter,

    started_at: Instant,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            plans: Counter::new(),
            plan_failures: Counter::new(),
            failover_runs: Counter::new(),
            failover_successes: Counter::new(),
            fallbacks: Counter::new(),
            last_resort_calls: Counter::new(),
            cancellations: Counter::new(),
            started_at: Instant::now(),
        }
    }

    /// Get or create metrics for a provider
    pub fn provider(&self, provider: &str) -> Arc<ProviderMetrics> {
        if let Some(existing) = self.providers.get(provider) {
            return existing.clone();
        }
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderMetrics::new(provider)))
            .clone()
    }

    /// Record a dispatched call's outcome
    pub fn record_call(&self, provider: &str, success: bool, latency: Duration) {
        let metrics = self.provider(provider);
        metrics.calls.inc();
        if success {
            metrics.successes.inc();
        } else {
            metrics.failures.inc();
        }
        metrics.latency.record_duration(latency);
    }

    /// Record a move to the next attempt
    pub fn record_fallback(&self, from: &str, to: &str) {
        self.fallbacks.inc();
        tracing::debug!(from, to, "Request fell back to alternate provider");
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Summaries for every provider, sorted by name
    pub fn provider_summaries(&self) -> Vec<ProviderMetricsSummary> {
        let sorted: BTreeMap<String, Arc<ProviderMetrics>> = self
            .providers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        sorted.values().map(|m| m.summary()).collect()
    }

    /// Compact summary for periodic logging
    pub fn summary(&self) -> RouterMetricsSummary {
        let providers = self.provider_summaries();
        RouterMetricsSummary {
            uptime_secs: self.uptime().as_secs(),
            plans: self.plans.get(),
            plan_failures: self.plan_failures.get(),
            failover_runs: self.failover_runs.get(),
            failover_successes: self.failover_successes.get(),
            fallbacks: self.fallbacks.get(),
            last_resort_calls: self.last_resort_calls.get(),
            cancellations: self.cancellations.get(),
            open_breakers: providers
                .iter()
                .filter(|p| p.phase == BreakerPhase::Open.gauge_value())
                .count(),
            providers,
        }
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let globals: [(&str, &str, &Counter); 7] = [
            ("gateway_plans_total", "Plans served", &self.plans),
            ("gateway_plan_failures_total", "Plans that failed", &self.plan_failures),
            ("gateway_failover_runs_total", "Failover runs started", &self.failover_runs),
            (
                "gateway_failover_successes_total",
                "Failover runs that succeeded",
                &self.failover_successes,
            ),
            ("gateway_fallbacks_total", "Moves to a later attempt", &self.fallbacks),
            (
                "gateway_last_resort_calls_total",
                "Calls made with every breaker open",
                &self.last_resort_calls,
            ),
            ("gateway_cancellations_total", "Failover runs cancelled", &self.cancellations),
        ];
        for (name, help, counter) in globals {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
                counter.get()
            ));
        }

        let providers = self.provider_summaries();
        let families: [(&str, &str, &str, fn(&ProviderMetricsSummary) -> String); 9] = [
            ("gateway_provider_calls_total", "counter", "Calls dispatched per provider", |p| {
                p.calls.to_string()
            }),
            ("gateway_provider_successes_total", "counter", "Successful calls per provider", |p| {
                p.successes.to_string()
            }),
            ("gateway_provider_failures_total", "counter", "Failed calls per provider", |p| {
                p.failures.to_string()
            }),
            (
                "gateway_breaker_rejected_total",
                "counter",
                "Calls denied by the circuit breaker",
                |p| p.rejected.to_string(),
            ),
            (
                "gateway_breaker_opened_total",
                "counter",
                "Transitions into OPEN",
                |p| p.transitions_open.to_string(),
            ),
            (
                "gateway_breaker_half_opened_total",
                "counter",
                "Transitions into HALF_OPEN",
                |p| p.transitions_half_open.to_string(),
            ),
            (
                "gateway_breaker_closed_total",
                "counter",
                "Transitions into CLOSED",
                |p| p.transitions_closed.to_string(),
            ),
            (
                "gateway_breaker_phase",
                "gauge",
                "Breaker phase (0 closed, 1 half-open, 2 open)",
                |p| p.phase.to_string(),
            ),
            (
                "gateway_provider_latency_p50_ms",
                "gauge",
                "Median call latency per provider",
                |p| p.latency_p50_ms.to_string(),
            ),
        ];
        for (name, kind, help, value) in families {
            if providers.is_empty() {
                break;
            }
            output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
            for summary in &providers {
                output.push_str(&format!(
                    "{name}{{provider=\"{}\"}} {}\n",
                    summary.provider,
                    value(summary)
                ));
            }
            output.push('\n');
        }

        output
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerObserver for RouterMetrics {
    fn on_transition(&self, transition: &BreakerTransition) {
        let metrics = self.provider(&transition.provider);
        metrics.phase.set(transition.to.gauge_value());
        match transition.to {
            BreakerPhase::Open => metrics.opened.inc(),
            BreakerPhase::HalfOpen => metrics.half_opened.inc(),
            BreakerPhase::Closed => metrics.closed.inc(),
        }
    }

    fn on_rejected(&self, provider: &str) {
        self.provider(provider).rejected.inc();
    }
}

/// Summary of router metrics
#[derive(Clone, Debug, Serialize)]
pub struct RouterMetricsSummary {
    pub uptime_secs: u64,
    pub plans: u64,
    pub plan_failures: u64,
    pub failover_runs: u64,
    pub failover_successes: u64,
    pub fallbacks: u64,
    pub last_resort_calls: u64,
    pub cancellations: u64,
    pub open_breakers: usize,
    pub providers: Vec<ProviderMetricsSummary>,
}

// ============================================================================
// Tests
// ============================================================================
