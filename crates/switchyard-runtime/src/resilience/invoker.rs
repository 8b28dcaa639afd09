//! Rate limiter, circuit breaker and retry composed around one backend call.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use switchyard_core::{CircuitState, DispatchConfig};

use super::{CircuitBreakers, InvocationError, RateLimiter, RetryPolicy};
use crate::backends::BackendError;

/// Executes backend operations under admission control, circuit breaking
/// and bounded retry.
pub struct ResilientInvoker {
    limiter: RateLimiter,
    breakers: CircuitBreakers,
    retry: RetryPolicy,
}

impl ResilientInvoker {
    pub fn new(limiter: RateLimiter, breakers: CircuitBreakers, retry: RetryPolicy) -> Self {
        Self {
            limiter,
            breakers,
            retry,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            RateLimiter::new(&config.resilience.rate_limit),
            CircuitBreakers::from_config(config),
            RetryPolicy::new(config.resilience.retry.clone()),
        )
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Breaker health of a backend.
    pub fn health(&self, backend: &str) -> CircuitState {
        self.breakers.state(backend)
    }

    /// Spend one admission token for `caller`.
    pub fn admit(&self, caller: &str) -> Result<(), InvocationError> {
        self.limiter.try_acquire(caller)?;
        Ok(())
    }

    /// Admit `caller` and then [`call`](Self::call) the operation.
    pub async fn invoke<T, F, Fut>(
        &self,
        caller: &str,
        backend: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, InvocationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.admit(caller)?;
        self.call(backend, timeout, operation).await
    }

    /// Run `operation` against `backend` through its breaker with retries.
    ///
    /// Each attempt is bounded by `timeout` and by what is left of the retry
    /// deadline. An attempt hitting `timeout` counts as a transient failure;
    /// one cut short by the deadline ends the call with `DeadlineExceeded`
    /// and is not charged to the breaker. Only
    /// transient failures are retried. The breaker is consulted before every
    /// attempt, so a circuit that opens mid-retry stops the loop.
    pub async fn call<T, F, Fut>(
        &self,
        backend: &str,
        timeout: Duration,
        mut operation: F,
    ) -> Result<T, InvocationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let deadline = Instant::now() + self.retry.deadline();
        let max_attempts = self.retry.max_attempts();
        let mut delays = self.retry.delays();
        let mut attempts = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(deadline_exceeded(backend, attempts));
            }

            let permit = self.breakers.acquire(backend)?;
            attempts += 1;

            let clamped = remaining < timeout;
            let attempt_timeout = timeout.min(remaining);
            let error = match tokio::time::timeout(attempt_timeout, operation()).await {
                Ok(Ok(value)) => {
                    permit.record_success();
                    return Ok(value);
                }
                Ok(Err(error)) => error,
                // Cut short by our own deadline, not the backend's fault
                Err(_) if clamped => {
                    drop(permit);
                    return Err(deadline_exceeded(backend, attempts));
                }
                Err(_) => BackendError::transient(format!(
                    "call timed out after {:?}",
                    attempt_timeout
                )),
            };

            if error.category.counts_against_breaker() {
                permit.record_failure();
            } else {
                drop(permit);
            }

            if !error.category.is_retryable() {
                tracing::debug!(
                    backend = %backend,
                    category = %error.category,
                    "Backend call failed, not retrying"
                );
                return Err(InvocationError::Backend {
                    backend: backend.to_string(),
                    error,
                });
            }

            if attempts >= max_attempts {
                tracing::warn!(
                    backend = %backend,
                    attempts,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(InvocationError::RetriesExhausted {
                    backend: backend.to_string(),
                    attempts,
                    last_error: error,
                });
            }

            let delay = delays.next().unwrap_or_default();
            if Instant::now() + delay >= deadline {
                return Err(deadline_exceeded(backend, attempts));
            }

            tracing::debug!(
                backend = %backend,
                attempt = attempts,
                delay = ?delay,
                error = %error,
                "Retrying backend call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn deadline_exceeded(backend: &str, attempts: u32) -> InvocationError {
    tracing::warn!(backend = %backend, attempts, "Retry deadline exceeded");
    InvocationError::DeadlineExceeded {
        backend: backend.to_string(),
        attempts,
    }
}
