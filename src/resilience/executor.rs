//! Retry loop guarded by a circuit breaker.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use super::outcome::OperationOutcome;
use super::retry::RetryPolicy;
use super::ResilienceConfig;
use crate::errors::{FetchError, FetchResult};
use crate::observability::{CircuitMetricsHook, MetricsCollector};

struct ExecutorInner {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

/// Runs operations with classified retry and a circuit breaker.
///
/// Cheap to clone; clones share one breaker.
#[derive(Clone)]
pub struct ResilienceExecutor {
    inner: Arc<ExecutorInner>,
}

impl ResilienceExecutor {
    /// Creates a new executor.
    pub fn new(config: &ResilienceConfig) -> Self {
        Self::from_parts(
            RetryPolicy::new(config.retry.clone()),
            CircuitBreaker::new(config.circuit_breaker.clone()),
            None,
        )
    }

    /// Creates an executor that reports retries and breaker transitions.
    pub fn with_metrics(config: &ResilienceConfig, metrics: Arc<dyn MetricsCollector>) -> Self {
        let hook = Arc::new(CircuitMetricsHook::new(Arc::clone(&metrics)));
        Self::from_parts(
            RetryPolicy::new(config.retry.clone()),
            CircuitBreaker::new(config.circuit_breaker.clone()).with_hook(hook),
            Some(metrics),
        )
    }

    /// Creates an executor from prebuilt parts.
    pub fn from_parts(
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        metrics: Option<Arc<dyn MetricsCollector>>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                retry,
                breaker,
                metrics,
            }),
        }
    }

    /// Returns the circuit breaker.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Returns a read-only view of the circuit breaker.
    pub fn circuit_status(&self) -> CircuitSnapshot {
        self.inner.breaker.snapshot()
    }

    /// Executes `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or the circuit refuses it.
    ///
    /// Every upstream failure is recorded on the breaker. Failures raised
    /// locally (rate-limit timeout, cancellation) are returned as they are
    /// and never counted. When the breaker opens between attempts the last
    /// upstream failure is returned rather than [`FetchError::CircuitOpen`].
    #[instrument(skip(self, cancel, operation), fields(max_attempts = self.inner.retry.config().max_attempts))]
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> FetchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OperationOutcome<T>>,
    {
        let retry = &self.inner.retry;
        let mut attempt = 0;
        let mut last_error: Option<FetchError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::cancelled("operation cancelled"));
            }
            attempt += 1;

            let permit = match self.inner.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => return Err(last_error.unwrap_or(open)),
            };

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    drop(permit);
                    return Err(FetchError::cancelled("operation cancelled"));
                }
                outcome = operation() => outcome,
            };

            let (error, retryable) = match outcome {
                OperationOutcome::Success(value) => {
                    permit.record_success();
                    return Ok(value);
                }
                OperationOutcome::Failure { error, retryable } => (error, retryable),
            };

            if !error.counts_toward_circuit() {
                drop(permit);
                return Err(error);
            }
            permit.record_failure();

            if !retryable || !retry.allows_retry(attempt) {
                if retryable {
                    tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
                }
                return Err(error);
            }

            let delay = retry.delay_for(attempt, &error);
            tracing::info!(
                attempt,
                max_attempts = retry.config().max_attempts,
                delay_ms = delay.as_millis(),
                error = %error,
                "Retrying after error"
            );
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_retry(delay);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(FetchError::cancelled("operation cancelled during backoff"));
                }
                () = tokio::time::sleep(delay) => {}
            }
            last_error = Some(error);
        }
    }
}

impl Default for ResilienceExecutor {
    fn default() -> Self {
        Self::new(&ResilienceConfig::default())
    }
}

impl std::fmt::Debug for ResilienceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceExecutor")
            .field("retry", &self.inner.retry)
            .field("breaker", &self.inner.breaker)
            .finish()
    }
}
