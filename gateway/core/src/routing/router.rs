//! Provider Router
//!
//! Composition object over the registry, breaker bank and selector. Built
//! explicitly by the application's composition root and shared behind an
//! `Arc`; there is no global instance.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerBank};
use super::clock::{system_clock, SharedClock};
use super::error::RoutingError;
use super::failover::FailoverResult;
use super::metrics::RouterMetrics;
use super::registry::{LogicalModel, ModelRegistry};
use super::selector::{PlanRequest, ProviderAttempt, ProviderSelector, SelectorConfig};

/// Routing engine entry point
#[derive(Debug)]
pub struct ProviderRouter {
    selector: ProviderSelector,
    max_retries: usize,
}

impl ProviderRouter {
    /// Create an empty router with default thresholds
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ProviderRouterBuilder {
        ProviderRouterBuilder::default()
    }

    // ------------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------------

    /// Upsert logical models (catalog-sync entry point)
    pub fn register(&self, models: impl IntoIterator<Item = LogicalModel>) {
        self.registry().register(models);
    }

    /// Replace the catalog; see [`ModelRegistry::replace_all`]
    pub fn replace_catalog(&self, models: impl IntoIterator<Item = LogicalModel>) -> usize {
        self.registry().replace_all(models)
    }

    // ------------------------------------------------------------------------
    // Planning and execution
    // ------------------------------------------------------------------------

    /// Ordered `(provider, provider_model_id)` attempts for a model
    pub fn plan_provider_attempts(
        &self,
        model_id: &str,
        preferred_provider: Option<&str>,
    ) -> Result<Vec<ProviderAttempt>, RoutingError> {
        self.selector.plan(model_id, preferred_provider)
    }

    /// Plan with preference and capability requirements
    pub fn plan(&self, request: &PlanRequest) -> Result<Vec<ProviderAttempt>, RoutingError> {
        self.selector.plan_request(request)
    }

    /// Run failover for a model
    pub async fn execute_with_failover<T, E, F, Fut>(
        &self,
        model_id: &str,
        execute_fn: F,
        max_retries: usize,
    ) -> Result<FailoverResult<T, E>, RoutingError>
    where
        F: FnMut(&str, &str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.selector
            .execute_with_failover(model_id, execute_fn, max_retries)
            .await
    }

    /// Run failover with the configured retry bound, honouring `cancel`
    pub async fn execute(
        &self,
        request: &PlanRequest,
        execute_fn: impl FnMut(&str, &str) -> BoxedCall,
        cancel: &CancellationToken,
    ) -> Result<FailoverResult<String, String>, RoutingError> {
        self.selector
            .execute_request_with_failover(request, execute_fn, self.max_retries, Some(cancel))
            .await
    }

    /// Retry bound used by [`execute`](Self::execute)
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    // ------------------------------------------------------------------------
    // Breaker administration
    // ------------------------------------------------------------------------

    /// Every breaker, keyed by provider
    pub fn list_breaker_states(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers().snapshots()
    }

    /// One breaker; `BreakerNotFound` if the provider has no history
    pub fn get_breaker_state(&self, provider: &str) -> Result<BreakerSnapshot, RoutingError> {
        self.breakers()
            .snapshot(provider)
            .ok_or_else(|| RoutingError::BreakerNotFound(provider.to_string()))
    }

    pub fn reset_breaker(&self, provider: &str) {
        tracing::info!(provider, "Breaker reset requested");
        self.breakers().reset(provider);
    }

    pub fn reset_all_breakers(&self) {
        tracing::info!(count = self.breakers().provider_count(), "Reset of all breakers requested");
        self.breakers().reset_all();
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Prometheus text export
    pub fn metrics_text(&self) -> String {
        self.metrics().to_prometheus()
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        self.selector.metrics()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.selector.registry()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerBank> {
        self.selector.breakers()
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Boxed provider call with string response and error, as used by [`ProviderRouter::execute`]
pub type BoxedCall = futures::future::BoxFuture<'static, Result<String, String>>;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ProviderRouter`]
pub struct ProviderRouterBuilder {
    breaker: BreakerConfig,
    overrides: Vec<(String, BreakerConfig)>,
    selector: SelectorConfig,
    max_retries: usize,
    clock: SharedClock,
    registry: Option<Arc<ModelRegistry>>,
}

impl Default for ProviderRouterBuilder {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            overrides: Vec::new(),
            selector: SelectorConfig::default(),
            max_retries: 3,
            clock: system_clock(),
            registry: None,
        }
    }
}

impl ProviderRouterBuilder {
    /// Default breaker thresholds
    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Thresholds for one provider
    pub fn provider_breaker_config(mut self, provider: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.push((provider.into(), config));
        self
    }

    pub fn selector_config(mut self, config: SelectorConfig) -> Self {
        self.selector = config;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing registry
    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> ProviderRouter {
        let breakers = Arc::new(CircuitBreakerBank::with_clock(self.breaker, self.clock));
        for (provider, config) in self.overrides {
            breakers.set_provider_config(provider, config);
        }
        let registry = self.registry.unwrap_or_else(|| Arc::new(ModelRegistry::new()));

        ProviderRouter {
            selector: ProviderSelector::new(registry, breakers, self.selector),
            max_retries: self.max_retries,
        }
    }
}
