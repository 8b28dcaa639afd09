//! # switchyard-runtime
//!
//! Async dispatch runtime for Switchyard.
//!
//! This crate performs the I/O that `switchyard-core` deliberately avoids:
//! calling backends, guarding them with rate limits, circuit breakers and
//! retries, and persisting conversation context.
//!
//! ## Layers
//!
//! - [`backends`]: the [`Backend`] trait vendor adapters implement, plus a registry
//! - [`resilience`]: per-caller token buckets, per-backend breakers, retry with backoff
//! - [`context`]: versioned conversation stores (memory, SQLite, cached)
//! - [`metrics`]: Prometheus counters for calls, tokens and task errors
//! - [`orchestrator`]: composes all of the above for one task at a time
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchyard_core::{DispatchConfig, Task};
//! use switchyard_runtime::{Orchestrator, SqliteContextStore};
//!
//! let config = DispatchConfig::from_file("switchyard.yaml")?;
//! let store = SqliteContextStore::open(&config.storage.database_path).await?;
//!
//! let orchestrator = Orchestrator::builder(config)
//!     .backend(Arc::new(MyClaudeAdapter::new()))
//!     .backend(Arc::new(MyGptAdapter::new()))
//!     .store(Arc::new(store))
//!     .build()?;
//!
//! let response = orchestrator
//!     .handle("caller-42", &Task::new("Fix the flaky test").with_conversation("c1"))
//!     .await?;
//! println!("{} answered: {}", response.backend, response.content);
//! ```

pub mod backends;
pub mod context;
pub mod metrics;
pub mod orchestrator;
pub mod resilience;

pub use backends::{Backend, BackendError, BackendRegistry, BackendResponse, ErrorCategory};
pub use context::{
    CachedContextStore, ContextError, ContextStore, MemoryContextStore, SqliteContextStore,
};
pub use metrics::{ActiveTask, BackendStats, DispatchMetrics};
pub use orchestrator::{
    BackendHealth, DispatchResponse, ErrorKind, OrchestrationError, Orchestrator,
    OrchestratorBuilder,
};
pub use resilience::{
    BreakerPermit, CircuitBreakers, CircuitOpen, InvocationError, RateLimitExceeded, RateLimiter,
    ResilientInvoker, RetryPolicy,
};
