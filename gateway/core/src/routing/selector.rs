//! Provider Selector
//!
//! Turns a logical model id into a ranked list of provider attempts.
//!
//! Candidates come from the registry, are filtered by static availability,
//! capability requirements and credentials, then ordered by:
//!
//! 1. OPEN breakers last (demoted, never dropped)
//! 2. Priority (ascending)
//! 3. CLOSED before HALF_OPEN
//! 4. Healthy before degraded
//! 5. Success rate (descending)
//! 6. Average latency (ascending)
//! 7. Combined cost (ascending)
//! 8. Provider name
//!
//! A preferred provider that is present and not OPEN is pinned to rank 0.
//! Health and breaker state are copied into a local vector before sorting so
//! no lock is held while ranking.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::breaker::{BreakerPhase, CircuitBreakerBank};
use super::error::RoutingError;
use super::health::{HealthSnapshot, HealthStatsTracker, DEFAULT_EMA_ALPHA};
use super::metrics::RouterMetrics;
use super::registry::{CapabilityRequirements, ModelRegistry, ProviderConfig};

// ============================================================================
// Types
// ============================================================================

/// One planned (provider, provider model id) pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderAttempt {
    /// Provider name
    pub provider: String,

    /// Model identifier sent upstream
    pub provider_model_id: String,

    /// Position in the plan, 0 is tried first
    pub rank: usize,

    /// Breaker phase when the plan was made
    pub phase: BreakerPhase,
}

/// Inputs to one planning call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanRequest {
    /// Logical model id
    pub model_id: String,

    /// Provider to pin at rank 0 when healthy
    pub preferred_provider: Option<String>,

    /// Capabilities the request needs
    pub requirements: CapabilityRequirements,
}

impl PlanRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn require(mut self, requirements: CapabilityRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Selector tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Smoothing factor for health stats
    pub ema_alpha: f64,

    /// Success rate below which a CLOSED provider is demoted
    pub degraded_success_rate: f64,

    /// Average latency above which a CLOSED provider is demoted
    pub degraded_latency_ms: f64,

    /// Providers with credentials configured; `None` disables the filter
    pub credentialed_providers: Option<HashSet<String>>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ema_alpha: DEFAULT_EMA_ALPHA,
            degraded_success_rate: 0.8,
            degraded_latency_ms: 10_000.0,
            credentialed_providers: None,
        }
    }
}

impl SelectorConfig {
    fn has_credentials(&self, offering: &ProviderConfig) -> bool {
        !offering.requires_credentials
            || self
                .credentialed_providers
                .as_ref()
                .map_or(true, |set| set.contains(&offering.provider))
    }
}

/// Ranking inputs for one candidate, copied out of shared state
struct Candidate<'a> {
    offering: &'a ProviderConfig,
    phase: BreakerPhase,
    degraded: bool,
    health: HealthSnapshot,
}

impl Candidate<'_> {
    fn phase_rank(&self) -> u8 {
        match self.phase {
            BreakerPhase::Closed => 0,
            BreakerPhase::HalfOpen => 1,
            BreakerPhase::Open => 2,
        }
    }

    fn is_open(&self) -> bool {
        self.phase == BreakerPhase::Open
    }
}

fn compare_candidates(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.is_open()
        .cmp(&b.is_open())
        .then_with(|| a.offering.priority.cmp(&b.offering.priority))
        .then_with(|| a.phase_rank().cmp(&b.phase_rank()))
        .then_with(|| a.degraded.cmp(&b.degraded))
        .then_with(|| b.health.success_rate.total_cmp(&a.health.success_rate))
        .then_with(|| a.health.avg_latency_ms.total_cmp(&b.health.avg_latency_ms))
        .then_with(|| a.offering.combined_cost().total_cmp(&b.offering.combined_cost()))
        .then_with(|| a.offering.provider.cmp(&b.offering.provider))
}

// ============================================================================
// Selector
// ============================================================================

/// Plans and executes provider attempts for logical models
pub struct ProviderSelector {
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) breakers: Arc<CircuitBreakerBank>,
    pub(crate) health: Arc<HealthStatsTracker>,
    pub(crate) metrics: Arc<RouterMetrics>,
    config: RwLock<SelectorConfig>,
}

impl ProviderSelector {
    /// Create a selector over existing components
    ///
    /// The metrics sink is registered as a breaker observer.
    pub fn new(
        registry: Arc<ModelRegistry>,
        breakers: Arc<CircuitBreakerBank>,
        config: SelectorConfig,
    ) -> Self {
        let metrics = Arc::new(RouterMetrics::new());
        breakers.add_observer(metrics.clone());
        Self {
            registry,
            breakers,
            health: Arc::new(HealthStatsTracker::with_alpha(config.ema_alpha)),
            metrics,
            config: RwLock::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerBank> {
        &self.breakers
    }

    pub fn health(&self) -> &Arc<HealthStatsTracker> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    /// Current tuning
    pub fn config(&self) -> SelectorConfig {
        self.config.read().clone()
    }

    /// Replace tuning; a new EMA factor applies to every provider from its
    /// next sample
    pub fn set_config(&self, config: SelectorConfig) {
        self.health.set_alpha(config.ema_alpha);
        *self.config.write() = config;
    }

    /// Plan attempts for a model with no capability requirements
    pub fn plan(
        &self,
        model_id: &str,
        preferred_provider: Option<&str>,
    ) -> Result<Vec<ProviderAttempt>, RoutingError> {
        let mut request = PlanRequest::new(model_id);
        request.preferred_provider = preferred_provider.map(str::to_string);
        self.plan_request(&request)
    }

    /// Plan attempts for a request
    ///
    /// Fails with `ModelNotFound` for unknown models and `NoProviders` when
    /// the model is known but nothing can serve the request.
    pub fn plan_request(&self, request: &PlanRequest) -> Result<Vec<ProviderAttempt>, RoutingError> {
        let result = self.build_plan(request);
        match &result {
            Ok(_) => self.metrics.plans.inc(),
            Err(e) => {
                self.metrics.plan_failures.inc();
                tracing::debug!(model = %request.model_id, error = %e, "Planning failed");
            }
        }
        result
    }

    fn build_plan(&self, request: &PlanRequest) -> Result<Vec<ProviderAttempt>, RoutingError> {
        let model = self.registry.lookup(&request.model_id)?;
        let config = self.config();

        let mut candidates: Vec<Candidate<'_>> = model
            .providers
            .iter()
            .filter(|offering| offering.available)
            .filter(|offering| offering.capabilities.satisfies(&request.requirements))
            .filter(|offering| config.has_credentials(offering))
            .map(|offering| {
                let health = self.health.snapshot(&offering.provider);
                Candidate {
                    offering,
                    phase: self.breakers.phase(&offering.provider),
                    degraded: health.is_degraded(config.degraded_success_rate, config.degraded_latency_ms),
                    health,
                }
            })
            .collect();

        if candidates.is_empty() {
            return Err(RoutingError::NoProviders(request.model_id.clone()));
        }

        candidates.sort_by(compare_candidates);

        if let Some(preferred) = request.preferred_provider.as_deref() {
            if let Some(pos) = candidates
                .iter()
                .position(|c| c.offering.provider == preferred && !c.is_open())
            {
                let pinned = candidates.remove(pos);
                candidates.insert(0, pinned);
            }
        }

        Ok(candidates
            .into_iter()
            .enumerate()
            .map(|(rank, c)| ProviderAttempt {
                provider: c.offering.provider.clone(),
                provider_model_id: c.offering.provider_model_id.clone(),
                rank,
                phase: c.phase,
            })
            .collect())
    }
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("models", &self.registry.model_count())
            .field("breakers", &self.breakers.provider_count())
            .field("config", &*self.config.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
