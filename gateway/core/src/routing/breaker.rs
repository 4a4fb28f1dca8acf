//! Circuit Breaker Bank
//!
//! One independent breaker per provider name, shared by every logical model
//! that provider serves.
//!
//! # State Machine
//!
//! ```text
//!              failure_threshold consecutive failures
//!              or failure rate > threshold over window
//! +--------+ ------------------------------------------> +------+
//! | CLOSED |                                             | OPEN | <--+
//! +--------+ <---------+                                 +------+    |
//!                      |                                    |        |
//!     success_threshold|        timeout elapsed, next allow()        |
//!     probe successes  |                                    v        |
//!                      |                             +-----------+   |
//!                      +---------------------------- | HALF_OPEN | --+
//!                                                    +-----------+
//!                                                     any probe failure
//! ```
//!
//! The OPEN -> HALF_OPEN move is lazy: it happens inside [`ProviderBreaker::allow`]
//! once the timeout has elapsed, never on a background timer. HALF_OPEN
//! admits one probe at a time; the next probe is admitted only after the
//! previous one's outcome has been recorded, or once the probe has been
//! outstanding for `timeout_seconds` without reporting (its lease lapses).
//!
//! # Locking
//!
//! Each breaker owns its own mutex, so activity on one provider never blocks
//! another. The bank map itself is a `DashMap`. Observers are notified after
//! the breaker lock is released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::clock::{system_clock, SharedClock};

/// Upper bound on samples kept in a rolling window, regardless of horizon
const MAX_WINDOW_SAMPLES: usize = 10_000;

// ============================================================================
// Phase
// ============================================================================

/// Circuit breaker phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPhase {
    /// Normal operation, calls allowed
    #[default]
    Closed,

    /// Tripped, calls rejected until the timeout elapses
    Open,

    /// Probing for recovery, one call at a time
    HalfOpen,
}

impl BreakerPhase {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    #[must_use]
    pub fn gauge_value(&self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl std::fmt::Display for BreakerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for one breaker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Consecutive successful probes that close it again
    pub success_threshold: u32,

    /// Seconds to stay OPEN before admitting a probe
    pub timeout_seconds: u64,

    /// Horizon of the rolling failure-rate window
    pub failure_window_seconds: u64,

    /// Failure rate (0.0 - 1.0) above which the circuit opens
    pub failure_rate_threshold: f64,

    /// Samples required in the window before the rate is evaluated
    pub min_requests_for_rate: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 60,
            failure_window_seconds: 60,
            failure_rate_threshold: 0.5,
            min_requests_for_rate: 10,
        }
    }
}

impl BreakerConfig {
    /// OPEN duration
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Rolling window horizon
    #[must_use]
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_seconds)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".into());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be at least 1".into());
        }
        if self.failure_window_seconds == 0 {
            return Err("failure_window_seconds must be at least 1".into());
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(format!(
                "failure_rate_threshold must be in (0, 1], got {}",
                self.failure_rate_threshold
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Observers
// ============================================================================

/// A phase change on one breaker
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerTransition {
    /// Provider name
    pub provider: String,
    /// Phase before
    pub from: BreakerPhase,
    /// Phase after
    pub to: BreakerPhase,
    /// Wall-clock time of the change
    pub at: DateTime<Utc>,
}

/// Receives breaker events (metrics sinks, shared-state mirrors)
///
/// Called outside the breaker lock; implementations must not block.
pub trait BreakerObserver: Send + Sync {
    /// A breaker changed phase
    fn on_transition(&self, transition: &BreakerTransition);

    /// A call was denied by `allow()`
    fn on_rejected(&self, _provider: &str) {}
}

type ObserverList = Arc<RwLock<Vec<Arc<dyn BreakerObserver>>>>;

fn notify_transition(observers: &ObserverList, transition: &BreakerTransition) {
    for observer in observers.read().iter() {
        observer.on_transition(transition);
    }
}

fn notify_rejected(observers: &ObserverList, provider: &str) {
    for observer in observers.read().iter() {
        observer.on_rejected(provider);
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Provider name
    pub provider: String,

    /// Current phase
    pub phase: BreakerPhase,

    /// Consecutive failures
    pub failure_count: u32,

    /// Consecutive successful probes (HALF_OPEN only)
    pub success_count: u32,

    /// Failure rate over the current window (0.0 when empty)
    pub failure_rate: f64,

    /// Samples currently in the window
    pub window_samples: usize,

    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,

    /// Seconds until a probe will be admitted (OPEN only)
    pub seconds_until_retry: Option<u64>,

    /// Lifetime successes recorded
    pub total_successes: u64,

    /// Lifetime failures recorded
    pub total_failures: u64,

    /// Lifetime calls denied by `allow()`
    pub rejected_calls: u64,

    /// Lifetime transitions into OPEN
    pub times_opened: u64,
}

// ============================================================================
// Provider Breaker
// ============================================================================

struct BreakerState {
    config: BreakerConfig,
    phase: BreakerPhase,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_transition_wall: Option<DateTime<Utc>>,
    probe_admitted_at: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            window: VecDeque::new(),
            opened_at: None,
            opened_at_wall: None,
            last_transition_wall: None,
            probe_admitted_at: None,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            times_opened: 0,
        }
    }

    fn push_sample(&mut self, now: Instant, success: bool) {
        self.window.push_back((now, success));
        if self.window.len() > MAX_WINDOW_SAMPLES {
            self.window.pop_front();
        }
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let horizon = self.config.failure_window();
        while let Some(&(at, _)) = self.window.front() {
            if now.saturating_duration_since(at) > horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn rate_exceeded(&self) -> bool {
        self.window.len() >= self.config.min_requests_for_rate as usize
            && self.failure_rate() > self.config.failure_rate_threshold
    }

    fn transition(
        &mut self,
        provider: &str,
        to: BreakerPhase,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Option<BreakerTransition> {
        let from = self.phase;
        if from == to {
            return None;
        }
        self.phase = to;
        self.last_transition_wall = Some(wall);
        match to {
            BreakerPhase::Open => {
                self.opened_at = Some(now);
                self.opened_at_wall = Some(wall);
                self.consecutive_successes = 0;
                self.probe_admitted_at = None;
                self.times_opened += 1;
            }
            BreakerPhase::HalfOpen => {
                self.consecutive_successes = 0;
                self.probe_admitted_at = None;
            }
            BreakerPhase::Closed => {
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.probe_admitted_at = None;
                self.opened_at = None;
                self.window.clear();
            }
        }
        Some(BreakerTransition {
            provider: provider.to_string(),
            from,
            to,
            at: wall,
        })
    }
}

/// Breaker for a single provider
pub struct ProviderBreaker {
    provider: String,
    clock: SharedClock,
    state: Mutex<BreakerState>,
    observers: ObserverList,
}

impl ProviderBreaker {
    /// Create a standalone breaker with the system clock
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(provider, config, system_clock())
    }

    /// Create a standalone breaker with an explicit clock
    pub fn with_clock(provider: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self::build(provider.into(), config, clock, Arc::new(RwLock::new(Vec::new())))
    }

    fn build(provider: String, config: BreakerConfig, clock: SharedClock, observers: ObserverList) -> Self {
        Self {
            provider,
            clock,
            state: Mutex::new(BreakerState::new(config)),
            observers,
        }
    }

    /// Provider name
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Current phase without side effects
    #[must_use]
    pub fn phase(&self) -> BreakerPhase {
        self.state.lock().phase
    }

    /// Whether a call may proceed now
    ///
    /// Performs the lazy OPEN -> HALF_OPEN transition once the timeout has
    /// elapsed; that call is admitted as the probe. A `false` return is a
    /// rejection, not a failure, and must not be fed into `record_failure`.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = {
            let mut state = self.state.lock();
            match state.phase {
                BreakerPhase::Closed => (true, None),
                BreakerPhase::Open => {
                    let due = state
                        .opened_at
                        .map_or(true, |at| now.saturating_duration_since(at) >= state.config.timeout());
                    if due {
                        let wall = self.clock.wall();
                        let transition = state.transition(&self.provider, BreakerPhase::HalfOpen, now, wall);
                        state.probe_admitted_at = Some(now);
                        (true, transition)
                    } else {
                        state.rejected_calls += 1;
                        (false, None)
                    }
                }
                BreakerPhase::HalfOpen => {
                    let lease = state.config.timeout();
                    match state.probe_admitted_at {
                        Some(at) if now.saturating_duration_since(at) < lease => {
                            state.rejected_calls += 1;
                            (false, None)
                        }
                        previous => {
                            if previous.is_some() {
                                tracing::debug!(
                                    provider = %self.provider,
                                    "Probe lease lapsed without an outcome, admitting a new probe"
                                );
                            }
                            state.probe_admitted_at = Some(now);
                            (true, None)
                        }
                    }
                }
            }
        };

        if let Some(transition) = transition {
            tracing::info!(provider = %self.provider, "Circuit breaker half-open, admitting probe");
            notify_transition(&self.observers, &transition);
        }
        if !allowed {
            notify_rejected(&self.observers, &self.provider);
        }
        allowed
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state.lock();
            state.total_successes += 1;
            state.push_sample(now, true);
            match state.phase {
                BreakerPhase::Closed => {
                    state.consecutive_failures = 0;
                    None
                }
                BreakerPhase::HalfOpen => {
                    state.probe_admitted_at = None;
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= state.config.success_threshold {
                        let wall = self.clock.wall();
                        state.transition(&self.provider, BreakerPhase::Closed, now, wall)
                    } else {
                        None
                    }
                }
                // Late result from a call dispatched before the circuit opened
                BreakerPhase::Open => None,
            }
        };

        if let Some(transition) = transition {
            tracing::info!(provider = %self.provider, "Circuit breaker closed - provider recovered");
            notify_transition(&self.observers, &transition);
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let (transition, consecutive_failures, failure_rate) = {
            let mut state = self.state.lock();
            state.total_failures += 1;
            state.push_sample(now, false);
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let transition = match state.phase {
                BreakerPhase::Closed => {
                    if state.consecutive_failures >= state.config.failure_threshold
                        || state.rate_exceeded()
                    {
                        let wall = self.clock.wall();
                        state.transition(&self.provider, BreakerPhase::Open, now, wall)
                    } else {
                        None
                    }
                }
                BreakerPhase::HalfOpen => {
                    let wall = self.clock.wall();
                    state.transition(&self.provider, BreakerPhase::Open, now, wall)
                }
                BreakerPhase::Open => None,
            };
            (transition, state.consecutive_failures, state.failure_rate())
        };

        if let Some(transition) = transition {
            tracing::warn!(
                provider = %self.provider,
                from = %transition.from,
                consecutive_failures,
                failure_rate,
                "Circuit breaker opened"
            );
            notify_transition(&self.observers, &transition);
        }
    }

    /// Record the outcome of a call that bypassed [`allow`](Self::allow)
    ///
    /// Counts toward totals and the rate window only. It never moves the
    /// phase and never touches the HALF_OPEN probe slot, which belongs to
    /// whichever call `allow` admitted.
    pub fn record_bypass(&self, success: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if success {
            state.total_successes += 1;
        } else {
            state.total_failures += 1;
        }
        state.push_sample(now, success);
    }

    /// Force back to CLOSED with all counters cleared
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state.lock();
            let wall = self.clock.wall();
            let transition = state.transition(&self.provider, BreakerPhase::Closed, now, wall);
            let config = state.config.clone();
            *state = BreakerState::new(config);
            state.last_transition_wall = transition.as_ref().map(|t| t.at);
            transition
        };

        tracing::info!(provider = %self.provider, "Circuit breaker reset");
        if let Some(transition) = transition {
            notify_transition(&self.observers, &transition);
        }
    }

    /// Adopt an OPEN phase observed by a sibling instance
    ///
    /// Applied only when the remote change is newer than this breaker's last
    /// transition, this breaker is not already OPEN, and the remote OPEN has
    /// not already outlived `timeout_seconds`. Returns whether the phase
    /// changed.
    pub fn adopt_open(&self, opened_at: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let wall_now = self.clock.wall();
        let transition = {
            let mut state = self.state.lock();
            if state.phase == BreakerPhase::Open {
                return false;
            }
            if state.last_transition_wall.is_some_and(|local| local >= opened_at) {
                return false;
            }
            let age = (wall_now - opened_at).to_std().unwrap_or_default();
            if age >= state.config.timeout() {
                return false;
            }
            let opened_instant = now.checked_sub(age).unwrap_or(now);
            let transition = state.transition(&self.provider, BreakerPhase::Open, opened_instant, opened_at);
            state.last_transition_wall = Some(opened_at);
            transition
        };

        match transition {
            Some(transition) => {
                tracing::warn!(
                    provider = %self.provider,
                    opened_at = %opened_at,
                    "Circuit breaker opened by shared state"
                );
                notify_transition(&self.observers, &transition);
                true
            }
            None => false,
        }
    }

    /// Replace thresholds; counters and phase are kept
    pub fn set_config(&self, config: BreakerConfig) {
        self.state.lock().config = config;
    }

    /// Current thresholds
    #[must_use]
    pub fn config(&self) -> BreakerConfig {
        self.state.lock().config.clone()
    }

    /// Snapshot for observability; never changes phase
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now);

        let seconds_until_retry = match (state.phase, state.opened_at) {
            (BreakerPhase::Open, Some(at)) => {
                let remaining = state
                    .config
                    .timeout()
                    .saturating_sub(now.saturating_duration_since(at));
                // Round up so a pending retry never reads as 0
                Some(remaining.as_millis().div_ceil(1000) as u64)
            }
            _ => None,
        };

        BreakerSnapshot {
            provider: self.provider.clone(),
            phase: state.phase,
            failure_count: state.consecutive_failures,
            success_count: state.consecutive_successes,
            failure_rate: state.failure_rate(),
            window_samples: state.window.len(),
            opened_at: state.opened_at_wall.filter(|_| state.phase != BreakerPhase::Closed),
            seconds_until_retry,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            rejected_calls: state.rejected_calls,
            times_opened: state.times_opened,
        }
    }
}

impl std::fmt::Debug for ProviderBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProviderBreaker")
            .field("provider", &self.provider)
            .field("phase", &state.phase)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("consecutive_successes", &state.consecutive_successes)
            .finish()
    }
}

// ============================================================================
// Bank
// ============================================================================

/// All breakers, keyed by provider name
///
/// Breakers are created lazily on the first recorded outcome for a provider
/// and live for the lifetime of the bank.
pub struct CircuitBreakerBank {
    breakers: DashMap<String, Arc<ProviderBreaker>>,
    default_config: RwLock<BreakerConfig>,
    overrides: RwLock<HashMap<String, BreakerConfig>>,
    clock: SharedClock,
    observers: ObserverList,
}

impl CircuitBreakerBank {
    /// Create a bank with default thresholds
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BreakerConfig::default())
    }

    /// Create a bank with custom default thresholds
    #[must_use]
    pub fn with_config(config: BreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a bank with custom thresholds and clock
    #[must_use]
    pub fn with_clock(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: RwLock::new(config),
            overrides: RwLock::new(HashMap::new()),
            clock,
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register an observer for transitions and rejections
    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers.write().push(observer);
    }

    /// Set default thresholds for providers without an override
    ///
    /// Existing breakers without an override pick up the new values.
    pub fn set_default_config(&self, config: BreakerConfig) {
        *self.default_config.write() = config;
        let overrides = self.overrides.read();
        let default = self.default_config.read();
        for entry in &self.breakers {
            if !overrides.contains_key(entry.key()) {
                entry.value().set_config(default.clone());
            }
        }
    }

    /// Set thresholds for one provider
    pub fn set_provider_config(&self, provider: impl Into<String>, config: BreakerConfig) {
        let provider = provider.into();
        if let Some(breaker) = self.breakers.get(&provider) {
            breaker.set_config(config.clone());
        }
        self.overrides.write().insert(provider, config);
    }

    /// Thresholds that apply to a provider
    #[must_use]
    pub fn config_for(&self, provider: &str) -> BreakerConfig {
        self.overrides
            .read()
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.default_config.read().clone())
    }

    /// Breaker for a provider, if one exists
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<ProviderBreaker>> {
        self.breakers.get(provider).map(|b| b.clone())
    }

    /// Breaker for a provider, created on first use
    pub fn get_or_create(&self, provider: &str) -> Arc<ProviderBreaker> {
        if let Some(existing) = self.get(provider) {
            return existing;
        }
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderBreaker::build(
                    provider.to_string(),
                    self.config_for(provider),
                    self.clock.clone(),
                    self.observers.clone(),
                ))
            })
            .clone()
    }

    /// Whether a call to `provider` may proceed now
    ///
    /// Providers with no recorded history are always allowed.
    pub fn allow(&self, provider: &str) -> bool {
        self.get(provider).map_or(true, |b| b.allow())
    }

    /// Record a successful call
    pub fn record_success(&self, provider: &str) {
        self.get_or_create(provider).record_success();
    }

    /// Record a failed call
    pub fn record_failure(&self, provider: &str) {
        self.get_or_create(provider).record_failure();
    }

    /// Record a call made without `allow` (last resort)
    pub fn record_bypass(&self, provider: &str, success: bool) {
        self.get_or_create(provider).record_bypass(success);
    }

    /// Current phase, CLOSED for providers without history
    #[must_use]
    pub fn phase(&self, provider: &str) -> BreakerPhase {
        self.get(provider).map_or(BreakerPhase::Closed, |b| b.phase())
    }

    /// Snapshot one breaker
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> Option<BreakerSnapshot> {
        self.get(provider).map(|b| b.snapshot())
    }

    /// Snapshot every breaker, ordered by provider name
    #[must_use]
    pub fn snapshots(&self) -> BTreeMap<String, BreakerSnapshot> {
        let breakers: Vec<Arc<ProviderBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        breakers
            .into_iter()
            .map(|b| (b.provider().to_string(), b.snapshot()))
            .collect()
    }

    /// Force one provider back to CLOSED
    pub fn reset(&self, provider: &str) {
        self.get_or_create(provider).reset();
    }

    /// Force every provider back to CLOSED
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<ProviderBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Adopt a remote OPEN for a provider
    pub fn adopt_open(&self, provider: &str, opened_at: DateTime<Utc>) -> bool {
        self.get_or_create(provider).adopt_open(opened_at)
    }

    /// Number of breakers created so far
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.breakers.len()
    }

    /// Clock used by this bank
    #[must_use]
    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }
}

impl Default for CircuitBreakerBank {
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
    use crate::routing::clock::{Clock, ManualClock};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn bank() -> (Arc<ManualClock>, CircuitBreakerBank) {
        let (clock, shared) = ManualClock::shared();
        (clock, CircuitBreakerBank::with_clock(BreakerConfig::default(), shared))
    }

    fn open(bank: &CircuitBreakerBank, provider: &str) {
        for _ in 0..bank.config_for(provider).failure_threshold {
            bank.record_failure(provider);
        }
    }

    #[test]
    fn test_unknown_provider_allowed_and_not_created() {
        let (_, bank) = bank();
        assert!(bank.allow("openai"));
        assert_eq!(bank.phase("openai"), BreakerPhase::Closed);
        assert_eq!(bank.provider_count(), 0);
        assert!(bank.snapshot("openai").is_none());
    }

    #[test]
    fn test_opens_after_exactly_failure_threshold() {
        let (_, bank) = bank();

        for _ in 0..4 {
            bank.record_failure("openai");
        }
        assert_eq!(bank.phase("openai"), BreakerPhase::Closed);
        assert!(bank.allow("openai"));

        bank.record_failure("openai");
        assert_eq!(bank.phase("openai"), BreakerPhase::Open);
        assert!(!bank.allow("openai"));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (_, bank) = bank();
        for _ in 0..4 {
            bank.record_failure("openai");
        }
        bank.record_success("openai");
        for _ in 0..4 {
            bank.record_failure("openai");
        }
        assert_eq!(bank.phase("openai"), BreakerPhase::Closed);
        assert_eq!(bank.snapshot("openai").unwrap().failure_count, 4);
    }

    #[test]
    fn test_open_rejects_until_timeout_then_single_probe() {
        let (clock, bank) = bank();
        open(&bank, "openai");

        clock.advance(Duration::from_secs(59));
        assert!(!bank.allow("openai"));
        assert_eq!(bank.phase("openai"), BreakerPhase::Open);

        clock.advance(Duration::from_secs(1));
        assert!(bank.allow("openai"));
        assert_eq!(bank.phase("openai"), BreakerPhase::HalfOpen);

        // Probe in flight: no second admission until an outcome is recorded
        assert!(!bank.allow("openai"));
        assert!(!bank.allow("openai"));

        bank.record_success("openai");
        assert_eq!(bank.phase("openai"), BreakerPhase::HalfOpen);
        assert!(bank.allow("openai"));
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let (clock, bank) = bank();
        open(&bank, "openai");
        clock.advance(Duration::from_secs(60));

        assert!(bank.allow("openai"));
        bank.record_success("openai");
        assert!(bank.allow("openai"));
        bank.record_success("openai");

        let snapshot = bank.snapshot("openai").unwrap();
        assert_eq!(snapshot.phase, BreakerPhase::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.window_samples, 0);
        assert!(snapshot.opened_at.is_none());
    }

    #[test]
    fn test_half_open_failure_reopens_and_resets_timer() {
        let (clock, bank) = bank();
        open(&bank, "openai");
        let first_open = bank.snapshot("openai").unwrap().opened_at.unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(bank.allow("openai"));
        bank.record_failure("openai");

        let snapshot = bank.snapshot("openai").unwrap();
        assert_eq!(snapshot.phase, BreakerPhase::Open);
        assert!(snapshot.opened_at.unwrap() > first_open);
        assert_eq!(snapshot.seconds_until_retry, Some(60));

        clock.advance(Duration::from_secs(30));
        assert!(!bank.allow("openai"));
        clock.advance(Duration::from_secs(30));
        assert!(bank.allow("openai"));
    }

    #[test]
    fn test_failure_rate_opens_circuit() {
        let (_, bank) = bank();

        // Alternate so consecutive failures never reach 5
        for _ in 0..5 {
            bank.record_success("anthropic");
            bank.record_failure("anthropic");
        }
        // 10 samples, rate 0.5: not above threshold
        assert_eq!(bank.phase("anthropic"), BreakerPhase::Closed);

        bank.record_failure("anthropic");
        // 11 samples, 6 failures: 0.545 > 0.5
        assert_eq!(bank.phase("anthropic"), BreakerPhase::Open);
    }

    #[test]
    fn test_failure_rate_requires_min_samples() {
        let (_, bank) = bank();
        bank.record_success("p");
        bank.record_failure("p");
        bank.record_failure("p");
        // Rate 0.66 but only 3 samples
        assert_eq!(bank.phase("p"), BreakerPhase::Closed);
    }

    #[test]
    fn test_window_expires_old_samples() {
        let (clock, bank) = bank();
        for _ in 0..6 {
            bank.record_success("p");
            bank.record_failure("p");
        }
        // Defeat the rate trigger by letting the window drain
        let snapshot = bank.snapshot("p").unwrap();
        assert!(snapshot.window_samples > 0);

        clock.advance(Duration::from_secs(61));
        let snapshot = bank.snapshot("p").unwrap();
        assert_eq!(snapshot.window_samples, 0);
        assert_eq!(snapshot.failure_rate, 0.0);
    }

    #[test]
    fn test_reset_round_trip() {
        let (_, bank) = bank();
        open(&bank, "openai");
        bank.reset("openai");

        let snapshot = bank.snapshot("openai").unwrap();
        assert_eq!(snapshot.phase, BreakerPhase::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert!(bank.allow("openai"));
    }

    #[test]
    fn test_reset_unknown_creates_closed_breaker() {
        let (_, bank) = bank();
        bank.reset("never-seen");
        let snapshot = bank.snapshot("never-seen").unwrap();
        assert_eq!(snapshot.phase, BreakerPhase::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[test]
    fn test_reset_all() {
        let (_, bank) = bank();
        open(&bank, "a");
        open(&bank, "b");
        bank.reset_all();
        assert!(bank
            .snapshots()
            .values()
            .all(|s| s.phase == BreakerPhase::Closed));
    }

    #[test]
    fn test_providers_are_independent() {
        let (_, bank) = bank();
        open(&bank, "a");
        assert_eq!(bank.phase("a"), BreakerPhase::Open);
        assert_eq!(bank.phase("b"), BreakerPhase::Closed);
        assert!(bank.allow("b"));
    }

    #[test]
    fn test_per_provider_config() {
        let (_, bank) = bank();
        bank.set_provider_config(
            "flaky",
            BreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        bank.record_failure("flaky");
        bank.record_failure("flaky");
        assert_eq!(bank.phase("flaky"), BreakerPhase::Open);

        bank.record_failure("steady");
        bank.record_failure("steady");
        assert_eq!(bank.phase("steady"), BreakerPhase::Closed);
    }

    #[test]
    fn test_rejections_counted() {
        let (_, bank) = bank();
        open(&bank, "a");
        assert!(!bank.allow("a"));
        assert!(!bank.allow("a"));
        assert_eq!(bank.snapshot("a").unwrap().rejected_calls, 2);
    }

    #[test]
    fn test_late_outcomes_while_open_do_not_transition() {
        let (_, bank) = bank();
        open(&bank, "a");
        bank.record_success("a");
        assert_eq!(bank.phase("a"), BreakerPhase::Open);
    }

    #[test]
    fn test_adopt_open_from_remote() {
        let (clock, bank) = bank();
        bank.record_success("a");
        let remote_opened = clock.wall();
        clock.advance(Duration::from_secs(10));

        assert!(bank.adopt_open("a", remote_opened));
        let snapshot = bank.snapshot("a").unwrap();
        assert_eq!(snapshot.phase, BreakerPhase::Open);
        assert_eq!(snapshot.seconds_until_retry, Some(50));

        // Already open: no-op
        assert!(!bank.adopt_open("a", remote_opened));
    }

    #[test]
    fn test_adopt_open_ignores_stale_remote() {
        let (clock, bank) = bank();
        let stale = clock.wall();
        clock.advance(Duration::from_secs(5));
        open(&bank, "a");
        bank.reset("a");

        assert!(!bank.adopt_open("a", stale));
        assert_eq!(bank.phase("a"), BreakerPhase::Closed);
    }

    #[test]
    fn test_adopt_open_skips_expired_remote() {
        let (clock, bank) = bank();
        let long_ago = clock.wall();
        clock.advance(Duration::from_secs(2 * 60 * 60));

        // No local history, but the remote circuit would already be half-open
        assert!(!bank.adopt_open("a", long_ago));
        assert_eq!(bank.phase("a"), BreakerPhase::Closed);
        assert!(bank.allow("a"));
        assert!(bank.allow("a"));
    }

    #[test]
    fn test_abandoned_half_open_lease_lapses() {
        let (clock, bank) = bank();
        open(&bank, "openai");
        clock.advance(Duration::from_secs(60));

        // Admitted probe never reports back
        assert!(bank.allow("openai"));
        clock.advance(Duration::from_secs(59));
        assert!(!bank.allow("openai"));

        clock.advance(Duration::from_secs(1));
        assert!(bank.allow("openai"));
        assert!(!bank.allow("openai"));
        assert_eq!(bank.phase("openai"), BreakerPhase::HalfOpen);
    }

    #[test]
    fn test_bypass_outcome_leaves_half_open_slot_alone() {
        let (clock, bank) = bank();
        bank.set_provider_config(
            "openai",
            BreakerConfig {
                success_threshold: 1,
                ..Default::default()
            },
        );
        open(&bank, "openai");
        clock.advance(Duration::from_secs(60));
        assert!(bank.allow("openai"));

        bank.record_bypass("openai", true);
        assert_eq!(bank.phase("openai"), BreakerPhase::HalfOpen);
        assert!(!bank.allow("openai"));

        bank.record_bypass("openai", false);
        assert_eq!(bank.phase("openai"), BreakerPhase::HalfOpen);

        let snapshot = bank.snapshot("openai").unwrap();
        assert_eq!(snapshot.total_successes, 1);
        assert_eq!(snapshot.total_failures, 6);

        // The admitted probe still decides
        bank.record_success("openai");
        assert_eq!(bank.phase("openai"), BreakerPhase::Closed);
    }

    #[derive(Default)]
    struct CountingObserver {
        transitions: Mutex<Vec<(BreakerPhase, BreakerPhase)>>,
        rejected: AtomicU64,
    }

    impl BreakerObserver for CountingObserver {
        fn on_transition(&self, transition: &BreakerTransition) {
            self.transitions.lock().push((transition.from, transition.to));
        }

        fn on_rejected(&self, _provider: &str) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_observer_sees_full_cycle() {
        let (clock, bank) = bank();
        let observer = Arc::new(CountingObserver::default());
        bank.add_observer(observer.clone());

        open(&bank, "a");
        assert!(!bank.allow("a"));
        clock.advance(Duration::from_secs(60));
        assert!(bank.allow("a"));
        bank.record_success("a");
        assert!(bank.allow("a"));
        bank.record_success("a");

        assert_eq!(
            *observer.transitions.lock(),
            vec![
                (BreakerPhase::Closed, BreakerPhase::Open),
                (BreakerPhase::Open, BreakerPhase::HalfOpen),
                (BreakerPhase::HalfOpen, BreakerPhase::Closed),
            ]
        );
        assert_eq!(observer.rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let (_, bank) = bank();
        let bank = Arc::new(bank);
        bank.set_provider_config(
            "p",
            BreakerConfig {
                failure_threshold: u32::MAX,
                failure_rate_threshold: 1.0,
                ..Default::default()
            },
        );

        let mut handles = vec![];
        for i in 0..8 {
            let b = bank.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    if i % 2 == 0 {
                        b.record_success("p");
                    } else {
                        b.record_failure("p");
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = bank.snapshot("p").unwrap();
        assert_eq!(snapshot.total_successes + snapshot.total_failures, 2000);
        assert_eq!(snapshot.phase, BreakerPhase::Closed);
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());
        assert!(BreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BreakerConfig {
            failure_rate_threshold: 1.5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
