//! Dispatch configuration parsing and validation.
//!
//! Configuration is structured data validated against an embedded JSON
//! Schema and then checked semantically. It is loaded once at startup and
//! passed by value into the router and resilience layer constructors.

mod duration;
mod parser;
mod schema;

pub use parser::{
    BackendConfig, BreakerSettings, ConfigError, ContextConfig, DispatchConfig, RateLimitSettings,
    ResilienceConfig, RetrySettings, RoutingConfig, StorageConfig,
};
pub use schema::{is_valid_config, validate_config_schema};
