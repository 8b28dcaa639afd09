//! # switchyard-core
//!
//! Deterministic building blocks of the Switchyard dispatch layer.
//!
//! This crate decides *where* a task should go and *what* history it
//! carries, without performing any I/O:
//! - Task classification into a closed set of kinds
//! - Rule- and capability-based backend selection
//! - Dispatch configuration parsing and validation
//! - Token estimation and context windowing
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same task and catalog always produce the same decision
//! 2. **Pure**: Routing and windowing never mutate their inputs
//! 3. **Never empty**: A successful routing decision names at least one backend
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_core::{BackendCatalog, DispatchConfig, Router, Task};
//!
//! let config = DispatchConfig::from_file("switchyard.yaml")?;
//! let catalog: BackendCatalog = config.descriptors().into_iter().collect();
//! let router = Router::new(config.routing.clone());
//!
//! let decision = router.route(&Task::new("Fix the failing test"), &catalog)?;
//! println!("{} -> {:?}", decision.reason, decision.ordered_candidates);
//! ```

pub mod classify;
pub mod config;
pub mod context;
pub mod router;
pub mod types;

pub use config::{
    BackendConfig, BreakerSettings, ConfigError, ContextConfig, DispatchConfig, RateLimitSettings,
    ResilienceConfig, RetrySettings, RoutingConfig, StorageConfig,
};
pub use context::{
    estimate_tokens, message_tokens, window, ConversationContext, Message, Role,
    MESSAGE_OVERHEAD_TOKENS,
};
pub use router::{BackendCatalog, RouteError, Router};
pub use types::{
    BackendDescriptor, Capabilities, CircuitState, PriorityRule, Requirements, RoutingDecision,
    RoutingReason, Task, TaskKind, TokenUsage,
};
