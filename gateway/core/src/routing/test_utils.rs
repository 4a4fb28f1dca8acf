//! Test helpers: a scripted provider that records every call

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerConfig, CircuitBreakerBank};
use super::clock::ManualClock;
use super::registry::{LogicalModel, ModelRegistry, ProviderConfig};
use super::selector::{ProviderSelector, SelectorConfig};

/// Error returned by a scripted provider
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{provider} failed: {message}")]
pub struct ScriptedError {
    pub provider: String,
    pub message: String,
}

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail,
    /// Cancel the token, then never complete
    CancelAndHang(CancellationToken),
    /// Never complete
    Hang,
}

/// Provider double with per-provider scripted behaviour
///
/// Providers without a script succeed.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    scripts: Arc<Mutex<HashMap<String, Behavior>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, provider: &str) -> &Self {
        self.scripts.lock().insert(provider.to_string(), Behavior::Fail);
        self
    }

    pub fn succeed(&self, provider: &str) -> &Self {
        self.scripts.lock().insert(provider.to_string(), Behavior::Succeed);
        self
    }

    /// Simulate a caller disconnect while this provider's call is in flight
    pub fn cancel_during(&self, provider: &str, token: CancellationToken) -> &Self {
        self.scripts
            .lock()
            .insert(provider.to_string(), Behavior::CancelAndHang(token));
        self
    }

    /// Calls to this provider never complete
    pub fn hang(&self, provider: &str) -> &Self {
        self.scripts.lock().insert(provider.to_string(), Behavior::Hang);
        self
    }

    /// Providers called so far, in order
    pub fn called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    /// (provider, provider model id) pairs called so far
    pub fn call_log(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn call(&self, provider: &str, model: &str) -> BoxFuture<'static, Result<String, ScriptedError>> {
        self.calls.lock().push((provider.to_string(), model.to_string()));
        let behavior = self
            .scripts
            .lock()
            .get(provider)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        let provider = provider.to_string();
        let model = model.to_string();

        async move {
            match behavior {
                Behavior::Succeed => Ok(format!("{provider}:{model}")),
                Behavior::Fail => Err(ScriptedError {
                    provider,
                    message: "upstream returned 503".into(),
                }),
                Behavior::CancelAndHang(token) => {
                    token.cancel();
                    futures::future::pending().await
                }
                Behavior::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }

    /// Closure suitable for `execute_with_failover`
    pub fn executor(
        &self,
    ) -> impl FnMut(&str, &str) -> BoxFuture<'static, Result<String, ScriptedError>> + '_ {
        move |provider: &str, model: &str| self.call(provider, model)
    }
}

/// Selector over one model with the given providers and a manual clock
pub fn selector_with(
    model_id: &str,
    providers: Vec<ProviderConfig>,
) -> (Arc<ManualClock>, ProviderSelector) {
    let (clock, shared) = ManualClock::shared();
    let registry = Arc::new(ModelRegistry::new());
    registry.register([LogicalModel::new(model_id).with_providers(providers)]);
    let breakers = Arc::new(CircuitBreakerBank::with_clock(BreakerConfig::default(), shared));
    (clock, ProviderSelector::new(registry, breakers, SelectorConfig::default()))
}

/// Providers `names` with ascending priority in the given order
pub fn ranked(names: &[&str]) -> Vec<ProviderConfig> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| ProviderConfig::new(*name, format!("{name}-model")).with_priority(i as u32 + 1))
        .collect()
}
