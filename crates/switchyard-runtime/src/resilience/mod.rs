//! Resilience patterns for switchyard-runtime.
//!
//! This module provides:
//! - Per-caller token bucket rate limiting
//! - Per-backend circuit breakers with a single half-open trial
//! - Retry with exponential backoff, jitter and an overall deadline
//! - The invoker composing all three around one logical backend call
//!
//! Limiter and breaker state are arenas keyed by caller / backend name
//! behind one mutex each. Locks are never held across an `.await`.

mod circuit_breaker;
mod invoker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{BreakerPermit, CircuitBreakers, CircuitOpen};
pub use invoker::ResilientInvoker;
pub use rate_limiter::{RateLimitExceeded, RateLimiter};
pub use retry::RetryPolicy;

use std::time::Duration;
use thiserror::Error;

use crate::backends::{BackendError, ErrorCategory};

/// Errors from a resilient backend invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    #[error("Backend '{backend}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        backend: String,
        attempts: u32,
        last_error: BackendError,
    },

    #[error("Deadline exceeded for backend '{backend}' after {attempts} attempts")]
    DeadlineExceeded { backend: String, attempts: u32 },

    /// A failure the retry policy does not re-attempt
    #[error("Backend '{backend}' failed: {error}")]
    Backend { backend: String, error: BackendError },
}

impl InvocationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            InvocationError::RateLimitExceeded { .. } => "rate_limited",
            InvocationError::CircuitOpen { .. } => "circuit_open",
            InvocationError::RetriesExhausted { .. } => "retries_exhausted",
            InvocationError::DeadlineExceeded { .. } => "deadline_exceeded",
            InvocationError::Backend { error, .. } => match error.category {
                ErrorCategory::Transient => "backend_transient",
                ErrorCategory::RateLimited => "backend_rate_limited",
                ErrorCategory::AuthFailure => "backend_auth_failure",
                ErrorCategory::Invalid => "backend_invalid",
                ErrorCategory::Unknown => "backend_unknown",
            },
        }
    }
}

impl From<RateLimitExceeded> for InvocationError {
    fn from(e: RateLimitExceeded) -> Self {
        InvocationError::RateLimitExceeded {
            retry_after: e.retry_after,
        }
    }
}

impl From<CircuitOpen> for InvocationError {
    fn from(e: CircuitOpen) -> Self {
        InvocationError::CircuitOpen { backend: e.backend }
    }
}
