//! Failover Driver
//!
//! Walks a plan, calling a caller-supplied `execute_fn` per attempt and
//! stopping at the first success.
//!
//! Per attempt:
//! - breaker denies: recorded as [`AttemptOutcome::SkippedCircuitOpen`],
//!   never fed into `record_failure`
//! - call returns `Ok`: `record_success`, run ends
//! - call returns `Err`: `record_failure`, next attempt
//! - caller cancels mid-call: the call is dropped, `record_failure`, run ends
//! - caller drops the whole run mid-call: an in-flight guard records the
//!   failure on drop
//!
//! If every examined attempt was skipped, the best-ranked one is called
//! anyway so a total outage is still attempted once. That call bypassed
//! `allow`, so its outcome counts toward totals and the rate window but never
//! moves the breaker phase or takes the HALF_OPEN probe slot.
//!
//! No engine lock is held across the `execute_fn` await.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::clock::SharedClock;
use super::error::RoutingError;
use super::selector::{PlanRequest, ProviderAttempt, ProviderSelector};

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to one examined attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome<E> {
    /// The provider returned a response
    Succeeded,

    /// The provider returned an error
    Failed(E),

    /// The breaker denied the call; the provider was never asked
    SkippedCircuitOpen,

    /// The caller cancelled while this call was in flight
    Cancelled,
}

impl<E> AttemptOutcome<E> {
    /// Whether `execute_fn` was invoked for this attempt
    pub fn was_called(&self) -> bool {
        !matches!(self, Self::SkippedCircuitOpen)
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    fn ends_run(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cancelled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::SkippedCircuitOpen => "skipped_circuit_open",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One examined attempt and its outcome
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptRecord<E> {
    pub provider: String,
    pub provider_model_id: String,
    pub rank: usize,
    pub outcome: AttemptOutcome<E>,
    /// Call duration, `None` when skipped
    pub latency: Option<Duration>,
    /// Made with every breaker open, bypassing `allow`
    pub last_resort: bool,
}

/// Aggregated result of one failover run
#[derive(Debug)]
pub struct FailoverResult<T, E> {
    /// Correlates log lines for this run
    pub run_id: Uuid,
    pub model_id: String,
    pub success: bool,
    pub response: Option<T>,
    pub provider_used: Option<String>,
    /// Calls actually made (skips excluded)
    pub attempts_tried: usize,
    /// Every examined attempt, in order
    pub attempts: Vec<AttemptRecord<E>>,
    pub cancelled: bool,
}

impl<T, E> FailoverResult<T, E> {
    fn new(run_id: Uuid, model_id: String) -> Self {
        Self {
            run_id,
            model_id,
            success: false,
            response: None,
            provider_used: None,
            attempts_tried: 0,
            attempts: Vec::new(),
            cancelled: false,
        }
    }

    /// Every provider error, paired with the provider that returned it
    pub fn errors(&self) -> Vec<(&str, &E)> {
        self.attempts
            .iter()
            .filter_map(|a| a.outcome.error().map(|e| (a.provider.as_str(), e)))
            .collect()
    }

    pub fn last_error(&self) -> Option<&E> {
        self.attempts.iter().rev().find_map(|a| a.outcome.error())
    }

    /// Attempts skipped by an open breaker
    pub fn skipped(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| !a.outcome.was_called())
            .count()
    }

    /// Whether every planned attempt was denied by its breaker
    pub fn all_circuit_broken(&self) -> bool {
        let mut planned = self.attempts.iter().filter(|a| !a.last_resort).peekable();
        planned.peek().is_some() && planned.all(|a| !a.outcome.was_called())
    }

    /// One-line description suitable for a user-facing message
    pub fn summary(&self) -> String {
        if self.success {
            let provider = self.provider_used.as_deref().unwrap_or("unknown");
            return format!(
                "succeeded via {provider} after {} provider{} attempted",
                self.attempts_tried,
                plural(self.attempts_tried)
            );
        }
        if self.cancelled {
            return format!(
                "cancelled after {} provider{} attempted",
                self.attempts_tried,
                plural(self.attempts_tried)
            );
        }
        if self.all_circuit_broken() {
            return match self.attempts.iter().find(|a| a.last_resort) {
                Some(last) => format!(
                    "all providers currently circuit-broken; last-resort call to {} failed",
                    last.provider
                ),
                None => "all providers currently circuit-broken".to_string(),
            };
        }
        let skipped = self.skipped();
        let mut summary = format!(
            "{} provider{} attempted, all failed",
            self.attempts_tried,
            plural(self.attempts_tried)
        );
        if skipped > 0 {
            summary.push_str(&format!(" ({skipped} skipped with open circuit)"));
        }
        summary
    }

    /// Take the response, if any
    pub fn into_response(self) -> Option<T> {
        self.response
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

// ============================================================================
// Driver
// ============================================================================

impl ProviderSelector {
    /// Plan `model_id` and try attempts in order until one succeeds
    ///
    /// `max_retries` bounds how many planned attempts are examined, skipped
    /// ones included; values below 1 count as 1. Only a planning failure is
    /// returned as `Err`; provider errors are collected in the result.
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
        self.execute_request_with_failover(&PlanRequest::new(model_id), execute_fn, max_retries, None)
            .await
    }

    /// [`execute_with_failover`](Self::execute_with_failover), stopping when
    /// `cancel` fires
    pub async fn execute_with_failover_cancellable<T, E, F, Fut>(
        &self,
        model_id: &str,
        execute_fn: F,
        max_retries: usize,
        cancel: &CancellationToken,
    ) -> Result<FailoverResult<T, E>, RoutingError>
    where
        F: FnMut(&str, &str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_request_with_failover(
            &PlanRequest::new(model_id),
            execute_fn,
            max_retries,
            Some(cancel),
        )
        .await
    }

    /// Failover for a full plan request (preference and requirements)
    pub async fn execute_request_with_failover<T, E, F, Fut>(
        &self,
        request: &PlanRequest,
        execute_fn: F,
        max_retries: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<FailoverResult<T, E>, RoutingError>
    where
        F: FnMut(&str, &str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let plan = self.plan_request(request)?;
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("failover", run_id = %run_id, model = %request.model_id);

        Ok(self
            .run_plan(run_id, request.model_id.clone(), plan, execute_fn, max_retries, cancel)
            .instrument(span)
            .await)
    }

    async fn run_plan<T, E, F, Fut>(
        &self,
        run_id: Uuid,
        model_id: String,
        plan: Vec<ProviderAttempt>,
        mut execute_fn: F,
        max_retries: usize,
        cancel: Option<&CancellationToken>,
    ) -> FailoverResult<T, E>
    where
        F: FnMut(&str, &str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.metrics.failover_runs.inc();
        let mut result = FailoverResult::new(run_id, model_id);
        let examined: Vec<ProviderAttempt> = plan.into_iter().take(max_retries.max(1)).collect();
        let mut previous: Option<&str> = None;

        for attempt in &examined {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                result.cancelled = true;
                break;
            }
            if let Some(prev) = previous {
                self.metrics.record_fallback(prev, &attempt.provider);
            }
            previous = Some(&attempt.provider);

            if !self.breakers.allow(&attempt.provider) {
                tracing::debug!(provider = %attempt.provider, "Circuit open, skipping provider");
                result.attempts.push(AttemptRecord {
                    provider: attempt.provider.clone(),
                    provider_model_id: attempt.provider_model_id.clone(),
                    rank: attempt.rank,
                    outcome: AttemptOutcome::SkippedCircuitOpen,
                    latency: None,
                    last_resort: false,
                });
                continue;
            }

            if self.dispatch(attempt, &mut execute_fn, cancel, false, &mut result).await {
                break;
            }
        }

        let nothing_called = result.attempts_tried == 0 && !result.cancelled;
        if nothing_called {
            if let Some(best) = examined.first() {
                tracing::warn!(
                    provider = %best.provider,
                    "Every circuit open, making last-resort call"
                );
                self.metrics.last_resort_calls.inc();
                self.dispatch(best, &mut execute_fn, cancel, true, &mut result).await;
            }
        }

        if result.cancelled {
            self.metrics.cancellations.inc();
            tracing::info!(attempts = result.attempts_tried, "Failover cancelled by caller");
        } else if result.success {
            self.metrics.failover_successes.inc();
        } else {
            tracing::warn!(
                attempts = result.attempts_tried,
                skipped = result.skipped(),
                "{}",
                result.summary()
            );
        }

        result
    }

    /// Call one attempt and record its outcome; returns whether the run is over
    async fn dispatch<T, E, F, Fut>(
        &self,
        attempt: &ProviderAttempt,
        execute_fn: &mut F,
        cancel: Option<&CancellationToken>,
        last_resort: bool,
        result: &mut FailoverResult<T, E>,
    ) -> bool
    where
        F: FnMut(&str, &str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut in_flight = InFlightGuard::new(self, &attempt.provider, last_resort);
        let call = execute_fn(&attempt.provider, &attempt.provider_model_id);

        // None: cancelled while in flight, the call future is dropped
        let response = match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => None,
                r = call => Some(r),
            },
            None => Some(call.await),
        };

        let success = matches!(response, Some(Ok(_)));
        let latency = in_flight.complete(success);
        result.attempts_tried += 1;
        let provider = attempt.provider.as_str();

        let outcome = match response {
            Some(Ok(response)) => {
                result.success = true;
                result.response = Some(response);
                result.provider_used = Some(provider.to_string());
                tracing::debug!(provider, latency_ms = latency.as_millis() as u64, "Provider call succeeded");
                AttemptOutcome::Succeeded
            }
            Some(Err(error)) => {
                tracing::debug!(provider, "Provider call failed");
                AttemptOutcome::Failed(error)
            }
            None => {
                result.cancelled = true;
                AttemptOutcome::Cancelled
            }
        };

        let done = outcome.ends_run();
        result.attempts.push(AttemptRecord {
            provider: attempt.provider.clone(),
            provider_model_id: attempt.provider_model_id.clone(),
            rank: attempt.rank,
            outcome,
            latency: Some(latency),
            last_resort,
        });
        done
    }

    /// Feed one call outcome into breaker, health and metrics
    fn record_outcome(&self, provider: &str, success: bool, latency: Duration, last_resort: bool) {
        match (last_resort, success) {
            (true, _) => self.breakers.record_bypass(provider, success),
            (false, true) => self.breakers.record_success(provider),
            (false, false) => self.breakers.record_failure(provider),
        }
        self.health.record(provider, success, latency);
        self.metrics.record_call(provider, success, latency);
    }
}

/// Records a failure for a call that is dropped before it completes
///
/// Dropping the failover future mid-call (client disconnect, handler
/// timeout) drops this guard with the call still outstanding.
struct InFlightGuard<'a> {
    selector: &'a ProviderSelector,
    provider: &'a str,
    last_resort: bool,
    clock: SharedClock,
    started: Instant,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(selector: &'a ProviderSelector, provider: &'a str, last_resort: bool) -> Self {
        let clock = selector.breakers.clock();
        let started = clock.now();
        Self {
            selector,
            provider,
            last_resort,
            clock,
            started,
            armed: true,
        }
    }

    fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }

    /// Record the outcome and disarm; returns the call latency
    fn complete(&mut self, success: bool) -> Duration {
        let latency = self.elapsed();
        self.armed = false;
        self.selector
            .record_outcome(self.provider, success, latency, self.last_resort);
        latency
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            provider = %self.provider,
            "Failover dropped with a provider call in flight, recording failure"
        );
        self.selector
            .record_outcome(self.provider, false, self.elapsed(), self.last_resort);
        self.selector.metrics.cancellations.inc();
    }
}

// ============================================================================
// Tests
// ============================================================================
