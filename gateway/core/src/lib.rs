//! Gateway Core - Provider Routing and Resilience for llm-gateway
//!
//! This crate decides, for every inference request, which upstream provider
//! serves a logical model, in what order to fall back, and when to stop
//! sending traffic to a provider that keeps failing. It performs no network
//! I/O of its own: the caller supplies the function that talks to a provider.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Composition root (daemon)                    │
//! │   GatewayConfig ──> ProviderRouterBuilder ──> ProviderRouter │
//! │   catalog.toml  ──> load_catalog ──────────> register()      │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                        ROUTING ENGINE                        │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │    Model     │  │ Provider Selector│  │ Circuit Breaker│  │
//! │  │   Registry   │<─│  plan + failover │─>│      Bank      │  │
//! │  └──────────────┘  └────────┬─────────┘  └───────┬────────┘  │
//! │                             │                    │           │
//! │                    ┌────────┴────────┐  ┌────────┴────────┐  │
//! │                    │ Health + Metrics│  │  BreakerMirror  │  │
//! │                    └─────────────────┘  └─────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ProviderRouter`]: The engine facade
//! - [`ModelRegistry`]: Logical model to provider offerings
//! - [`CircuitBreakerBank`]: One breaker per provider name
//! - [`ProviderSelector`]: Ranking and the failover driver
//! - [`FailoverResult`]: Outcome of one failover run
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{LogicalModel, ProviderConfig, ProviderRouter};
//!
//! let router = ProviderRouter::new();
//! router.register([LogicalModel::new("gemini-1.5-flash")
//!     .with_provider(ProviderConfig::new("google", "gemini-1.5-flash-002").with_priority(1))
//!     .with_provider(ProviderConfig::new("openrouter", "google/gemini-flash-1.5").with_priority(2))]);
//!
//! let result = router
//!     .execute_with_failover("gemini-1.5-flash", |provider, model| call_upstream(provider, model), 3)
//!     .await?;
//! println!("{}", result.summary());
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod routing;

// Re-export commonly used types
pub use catalog::{load_catalog, parse_catalog, CatalogError};
pub use config::{
    default_config_path, default_data_dir, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GatewayConfig, GatewayToml,
};
pub use routing::{
    AttemptOutcome, AttemptRecord, BreakerConfig, BreakerMirror, BreakerObserver, BreakerPhase,
    BreakerSnapshot, BreakerStateStore, CapabilityRequirements, CircuitBreakerBank, Clock,
    FailoverResult, FileStateStore, HealthStatsTracker, InMemoryStateStore, LogicalModel, ManualClock,
    ModelRegistry, PlanRequest, ProviderAttempt, ProviderCapabilities, ProviderConfig,
    ProviderRouter, ProviderRouterBuilder, ProviderSelector, RouterMetrics, RoutingError,
    SelectorConfig, SharedBreakerState, StoreError, SystemClock,
};
