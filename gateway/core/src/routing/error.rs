//! Routing Errors

use thiserror::Error;

/// Errors surfaced by the routing engine
///
/// Provider-level failures never appear here; they are absorbed into the
/// failover loop and reported per attempt.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The logical model is not registered
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The model is registered but no provider can serve the request
    #[error("No providers available for model: {0}")]
    NoProviders(String),

    /// No breaker has been created for this provider yet
    #[error("No circuit breaker recorded for provider: {0}")]
    BreakerNotFound(String),
}

impl RoutingError {
    /// Whether this is a NotFound kind (unknown model or unknown breaker)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModelNotFound(_) | Self::BreakerNotFound(_))
    }
}
