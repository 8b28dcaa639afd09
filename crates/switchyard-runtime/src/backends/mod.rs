//! Backend abstractions for switchyard-runtime.
//!
//! A backend is one interchangeable upstream AI service. Concrete vendor
//! adapters live outside this crate; they implement [`Backend`] and
//! classify their own failures into an [`ErrorCategory`] so the resilience
//! layer never has to inspect vendor-specific errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use switchyard_core::{Capabilities, ConversationContext, Task, TokenUsage};

mod registry;

pub use registry::BackendRegistry;

/// Pre-classified failure category reported by a backend adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network errors, timeouts, 5xx. Safe to retry.
    Transient,

    /// The upstream throttled us
    RateLimited,

    /// Credentials rejected
    AuthFailure,

    /// The request itself is bad; retrying or failing over will not help
    Invalid,

    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::AuthFailure => "auth_failure",
            ErrorCategory::Invalid => "invalid",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether the retry policy may re-attempt this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    /// Whether this failure counts against the backend's circuit breaker.
    ///
    /// `Invalid` is the caller's fault and says nothing about backend health.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, ErrorCategory::Invalid)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category} backend error: {message}")]
pub struct BackendError {
    pub category: ErrorCategory,
    pub message: String,
}

impl BackendError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimited, message)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AuthFailure, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Invalid, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, message)
    }
}

/// Response from a backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    /// Generated content
    pub content: String,

    /// Model that produced the content
    pub model: String,

    /// Token usage, for downstream cost accounting
    pub usage: TokenUsage,
}

/// Contract every upstream adapter implements.
///
/// `send` receives the already-windowed context; adapters must not assume
/// they see the full history.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Unique name, used as the registry key and in routing rules.
    fn name(&self) -> &str;

    /// Static capabilities advertised to the router.
    fn capabilities(&self) -> Capabilities;

    /// Send a task together with its context window.
    async fn send(
        &self,
        window: &ConversationContext,
        task: &Task,
    ) -> Result<BackendResponse, BackendError>;

    /// Cheap liveness check.
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(!ErrorCategory::RateLimited.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
        assert!(!ErrorCategory::Invalid.is_retryable());
    }

    #[test]
    fn test_invalid_does_not_count_against_breaker() {
        assert!(!ErrorCategory::Invalid.counts_against_breaker());
        assert!(ErrorCategory::AuthFailure.counts_against_breaker());
        assert!(ErrorCategory::RateLimited.counts_against_breaker());
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::transient("connection reset");
        assert_eq!(err.to_string(), "transient backend error: connection reset");
    }
}
