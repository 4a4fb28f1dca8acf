#![allow(missing_docs)]
//! Provider Routing and Resilience
//!
//! Maps logical models to the providers that serve them, ranks providers per
//! request from priority and live health, and guards every provider behind its
//! own circuit breaker.
//!
//! # Architecture
//!
//! ```text
//! +--------------------+
//! |   ProviderRouter   |  <-- Entry point: plan, failover, breaker admin
//! +---------+----------+
//!           |
//!           v
//! +--------------------+      +------------------+
//! |  ProviderSelector  | ---> |  RouterMetrics   |
//! |  plan + failover   |      +------------------+
//! +----+----------+----+               ^
//!      |          |                    | BreakerObserver
//!      v          v                    |
//! +---------+ +--------------------+   |    +---------------+
//! |Registry | | CircuitBreakerBank | --+--> | BreakerMirror | --> shared store
//! +---------+ +--------------------+        +---------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Demote, never drop**: OPEN providers go to the end of a plan, and a
//!    total outage still gets one last-resort call
//! 2. **Per-provider isolation**: one lock per breaker, no bank-wide lock
//! 3. **No I/O in the core**: provider calls belong to the caller's `execute_fn`
//! 4. **Best-effort sharing**: the shared store is an optimisation, never a dependency

pub mod breaker;
pub mod clock;
pub mod error;
pub mod failover;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod selector;
pub mod store;

#[cfg(test)]
pub mod test_utils;

pub use breaker::{
    BreakerConfig, BreakerObserver, BreakerPhase, BreakerSnapshot, BreakerTransition,
    CircuitBreakerBank, ProviderBreaker,
};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::RoutingError;
pub use failover::{AttemptOutcome, AttemptRecord, FailoverResult};
pub use health::{HealthSnapshot, HealthStatsTracker, ProviderHealthStats};
pub use metrics::{RouterMetrics, RouterMetricsSummary};
pub use registry::{
    CapabilityRequirements, LogicalModel, Modality, ModelRegistry, ProviderCapabilities,
    ProviderConfig, RegistrySnapshot,
};
pub use router::{BoxedCall, ProviderRouter, ProviderRouterBuilder};
pub use selector::{PlanRequest, ProviderAttempt, ProviderSelector, SelectorConfig};
pub use store::{
    BreakerMirror, BreakerStateStore, FileStateStore, InMemoryStateStore, SharedBreakerState, StoreError,
};
