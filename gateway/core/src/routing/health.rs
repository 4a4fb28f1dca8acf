//! Provider Health Statistics
//!
//! Rolling success rate and latency per provider, used by the selector to
//! break priority ties and to demote providers that are CLOSED but slow.
//!
//! Both signals are exponential moving averages updated with compare-and-swap
//! loops, so recording an outcome never takes a lock. The tracker hands out
//! plain-value snapshots; ranking never holds a reference into the map.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Fixed-point scale for rates stored in atomics
const RATE_SCALE: f64 = 10_000.0;

/// Default EMA smoothing factor
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

fn clamp_alpha(alpha: f64) -> f64 {
    alpha.clamp(f64::EPSILON, 1.0)
}

// ============================================================================
// Per-provider Stats
// ============================================================================

/// Health statistics for a single provider
pub struct ProviderHealthStats {
    /// Provider name
    pub provider: String,

    /// Smoothing factor as `f64` bits
    alpha_bits: AtomicU64,

    /// Success rate (fixed-point: value * 10000)
    success_rate_fp: AtomicU32,

    /// Average latency in microseconds
    avg_latency_us: AtomicU64,

    samples: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ProviderHealthStats {
    /// Create stats with the default smoothing factor
    pub fn new(provider: impl Into<String>) -> Self {
        Self::with_alpha(provider, DEFAULT_EMA_ALPHA)
    }

    /// Create stats with a custom smoothing factor (0.0 - 1.0]
    pub fn with_alpha(provider: impl Into<String>, alpha: f64) -> Self {
        Self {
            provider: provider.into(),
            alpha_bits: AtomicU64::new(clamp_alpha(alpha).to_bits()),
            success_rate_fp: AtomicU32::new(RATE_SCALE as u32),
            avg_latency_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Current smoothing factor
    #[must_use]
    pub fn alpha(&self) -> f64 {
        f64::from_bits(self.alpha_bits.load(Ordering::Acquire))
    }

    /// Change the smoothing factor; applies from the next sample
    pub fn set_alpha(&self, alpha: f64) {
        self.alpha_bits
            .store(clamp_alpha(alpha).to_bits(), Ordering::Release);
    }

    /// Record one called attempt
    pub fn record(&self, success: bool, latency: Duration) {
        let first = self.samples.fetch_add(1, Ordering::AcqRel) == 0;
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.update_success_rate(success, first);
        self.update_latency(latency, first);
    }

    fn update_success_rate(&self, success: bool, first: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        let alpha = self.alpha();

        loop {
            let current_fp = self.success_rate_fp.load(Ordering::Acquire);
            let current = f64::from(current_fp) / RATE_SCALE;
            let next = if first {
                sample
            } else {
                alpha * sample + (1.0 - alpha) * current
            };
            let next_fp = (next * RATE_SCALE).round() as u32;

            if self
                .success_rate_fp
                .compare_exchange(current_fp, next_fp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    fn update_latency(&self, latency: Duration, first: bool) {
        let sample = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let alpha = self.alpha();

        loop {
            let current = self.avg_latency_us.load(Ordering::Acquire);
            let next = if first {
                sample
            } else {
                (alpha * sample as f64 + (1.0 - alpha) * current as f64) as u64
            };

            if self
                .avg_latency_us
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Smoothed success rate (1.0 before any sample)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        f64::from(self.success_rate_fp.load(Ordering::Acquire)) / RATE_SCALE
    }

    /// Smoothed latency
    #[must_use]
    pub fn avg_latency(&self) -> Duration {
        Duration::from_micros(self.avg_latency_us.load(Ordering::Acquire))
    }

    /// Number of recorded attempts
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }

    /// Plain-value copy of the current stats
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            provider: self.provider.clone(),
            success_rate: self.success_rate(),
            avg_latency_ms: self.avg_latency().as_secs_f64() * 1000.0,
            samples: self.samples(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ProviderHealthStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHealthStats")
            .field("provider", &self.provider)
            .field("success_rate", &self.success_rate())
            .field("avg_latency", &self.avg_latency())
            .field("samples", &self.samples())
            .finish()
    }
}

/// Snapshot of a provider's health stats
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Provider name
    pub provider: String,
    /// Smoothed success rate
    pub success_rate: f64,
    /// Smoothed latency in milliseconds
    pub avg_latency_ms: f64,
    /// Total recorded attempts
    pub samples: u64,
    /// Total successes
    pub successes: u64,
    /// Total failures
    pub failures: u64,
}

impl HealthSnapshot {
    /// Snapshot for a provider with no history
    #[must_use]
    pub fn unknown(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            samples: 0,
            successes: 0,
            failures: 0,
        }
    }

    /// Whether this provider is degraded under the given limits
    ///
    /// Providers without samples are never degraded.
    #[must_use]
    pub fn is_degraded(&self, min_success_rate: f64, max_latency_ms: f64) -> bool {
        self.samples > 0 && (self.success_rate < min_success_rate || self.avg_latency_ms > max_latency_ms)
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Per-provider health stats, keyed by provider name
#[derive(Debug)]
pub struct HealthStatsTracker {
    stats: DashMap<String, Arc<ProviderHealthStats>>,
    alpha_bits: AtomicU64,
}

impl HealthStatsTracker {
    /// Create a tracker with the default smoothing factor
    #[must_use]
    pub fn new() -> Self {
        Self::with_alpha(DEFAULT_EMA_ALPHA)
    }

    /// Create a tracker with a custom smoothing factor
    #[must_use]
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            stats: DashMap::new(),
            alpha_bits: AtomicU64::new(clamp_alpha(alpha).to_bits()),
        }
    }

    /// Smoothing factor given to newly tracked providers
    #[must_use]
    pub fn alpha(&self) -> f64 {
        f64::from_bits(self.alpha_bits.load(Ordering::Acquire))
    }

    /// Change the smoothing factor for every provider, tracked or not
    ///
    /// Existing averages are kept; only later samples use the new factor.
    pub fn set_alpha(&self, alpha: f64) {
        self.alpha_bits
            .store(clamp_alpha(alpha).to_bits(), Ordering::Release);
        for entry in &self.stats {
            entry.value().set_alpha(alpha);
        }
    }

    /// Get existing stats
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<ProviderHealthStats>> {
        self.stats.get(provider).map(|s| s.clone())
    }

    /// Get or create stats
    pub fn get_or_create(&self, provider: &str) -> Arc<ProviderHealthStats> {
        if let Some(existing) = self.get(provider) {
            return existing;
        }
        self.stats
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderHealthStats::with_alpha(provider, self.alpha())))
            .clone()
    }

    /// Record one called attempt
    pub fn record(&self, provider: &str, success: bool, latency: Duration) {
        self.get_or_create(provider).record(success, latency);
    }

    /// Snapshot for one provider; unknown providers report neutral stats
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> HealthSnapshot {
        self.get(provider)
            .map_or_else(|| HealthSnapshot::unknown(provider), |s| s.snapshot())
    }

    /// Snapshots for every tracked provider, sorted by name
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        let mut all: Vec<HealthSnapshot> = self.stats.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Number of tracked providers
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.stats.len()
    }
}

impl Default for HealthStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_averages() {
        let stats = ProviderHealthStats::new("openai");
        assert_eq!(stats.success_rate(), 1.0);

        stats.record(false, Duration::from_millis(200));
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_latency(), Duration::from_millis(200));
        assert_eq!(stats.samples(), 1);
    }

    #[test]
    fn test_ema_moves_toward_samples() {
        let stats = ProviderHealthStats::with_alpha("openai", 0.5);
        stats.record(true, Duration::from_millis(100));
        stats.record(false, Duration::from_millis(300));

        assert!((stats.success_rate() - 0.5).abs() < 1e-3);
        assert_eq!(stats.avg_latency(), Duration::from_millis(200));
    }

    #[test]
    fn test_degraded_requires_samples() {
        let fresh = HealthSnapshot::unknown("p");
        assert!(!fresh.is_degraded(0.8, 1000.0));

        let tracker = HealthStatsTracker::new();
        tracker.record("p", true, Duration::from_secs(5));
        assert!(tracker.snapshot("p").is_degraded(0.8, 1000.0));
        assert!(!tracker.snapshot("p").is_degraded(0.8, 10_000.0));
    }

    #[test]
    fn test_tracker_snapshots_sorted() {
        let tracker = HealthStatsTracker::new();
        tracker.record("zeta", true, Duration::from_millis(1));
        tracker.record("alpha", true, Duration::from_millis(1));

        let names: Vec<_> = tracker.all_snapshots().into_iter().map(|s| s.provider).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(tracker.provider_count(), 2);
    }

    #[test]
    fn test_set_alpha_reaches_tracked_and_new_providers() {
        let tracker = HealthStatsTracker::with_alpha(0.3);
        tracker.record("old", true, Duration::from_millis(100));

        tracker.set_alpha(1.0);
        tracker.record("old", false, Duration::from_millis(300));
        tracker.record("new", true, Duration::from_millis(10));

        let old = tracker.snapshot("old");
        assert_eq!(old.success_rate, 0.0);
        assert_eq!(old.avg_latency_ms, 300.0);
        assert_eq!(tracker.get("new").unwrap().alpha(), 1.0);
    }

    #[test]
    fn test_unknown_provider_snapshot_is_neutral() {
        let tracker = HealthStatsTracker::new();
        let snapshot = tracker.snapshot("nobody");
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(tracker.provider_count(), 0);
    }

    #[test]
    fn test_concurrent_recording() {
        use std::thread;

        let tracker = Arc::new(HealthStatsTracker::new());
        let mut handles = vec![];
        for i in 0..8 {
            let t = tracker.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    t.record("p", i % 2 == 0, Duration::from_millis(10));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot("p");
        assert_eq!(snapshot.samples, 800);
        assert_eq!(snapshot.successes, 400);
        assert_eq!(snapshot.failures, 400);
        assert!(snapshot.success_rate >= 0.0 && snapshot.success_rate <= 1.0);
    }
}
