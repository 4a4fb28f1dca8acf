//! Time Source
//!
//! Breakers and health stats never call `Instant::now()` directly. They read
//! time through a [`Clock`] so that timeouts and rolling windows can be driven
//! deterministically in tests and simulations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Monotonic instant used for timeouts and windows
    fn now(&self) -> Instant;

    /// Wall-clock time used for reporting (`opened_at`)
    fn wall(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Real time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Create the default shared clock
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Manually advanced clock
///
/// Starts at the instant it was created and only moves when
/// [`ManualClock::advance`] is called.
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_wall: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current time
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a shared handle, returning both the concrete clock and the trait object
    #[must_use]
    pub fn shared() -> (Arc<Self>, SharedClock) {
        let clock = Arc::new(Self::new());
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since creation
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + *self.offset.lock()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(*self.offset.lock()).unwrap_or_default();
        self.base_wall + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        let wall_start = clock.wall();

        clock.advance(Duration::from_secs(30));

        assert_eq!(clock.now() - start, Duration::from_secs(30));
        assert_eq!((clock.wall() - wall_start).num_seconds(), 30);
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn test_manual_clock_frozen_without_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), clock.now());
    }
}
