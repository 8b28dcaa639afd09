//! Configuration parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::duration;
use super::schema::validate_config_schema;
use crate::types::{BackendDescriptor, Capabilities, PriorityRule, TaskKind};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Routing rule table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Backend used when no rule matches the task kind
    pub default_backend: String,

    /// Ordered backend preferences per task kind
    #[serde(default)]
    pub rules: BTreeMap<TaskKind, Vec<String>>,
}

impl RoutingConfig {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            default_backend: default_backend.into(),
            rules: BTreeMap::new(),
        }
    }

    /// Add or replace the rule for a kind.
    pub fn with_rule<I, S>(mut self, kind: TaskKind, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .insert(kind, backends.into_iter().map(Into::into).collect());
        self
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within `window` that open the circuit
    pub failure_threshold: u32,

    /// Time spent open before a trial is allowed
    #[serde(with = "duration")]
    pub cooldown: Duration,

    /// Sliding window for counting failures
    #[serde(with = "duration")]
    pub window: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

/// Retry policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,

    #[serde(with = "duration")]
    pub base_delay: Duration,

    #[serde(with = "duration")]
    pub max_delay: Duration,

    /// Overall budget across all attempts and backoff sleeps
    #[serde(with = "duration")]
    pub deadline: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Token bucket parameters for caller admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub capacity: u32,

    /// Tokens added per second
    pub refill_rate: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
}

/// Context windowing and call timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Upper bound on tokens of history sent with a task
    pub max_window_tokens: u32,

    /// Tokens kept free in the backend's window for its response
    pub reserved_response_tokens: u32,

    /// Timeout for a single backend call
    #[serde(with = "duration")]
    pub call_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_window_tokens: 8000,
            reserved_response_tokens: 1000,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ContextConfig {
    /// History budget for a backend with the given capabilities.
    pub fn window_budget(&self, capabilities: &Capabilities) -> u32 {
        self.max_window_tokens.min(
            capabilities
                .max_tokens
                .saturating_sub(self.reserved_response_tokens),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding conversation contexts
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("switchyard.db"),
        }
    }
}

/// Per-backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub capabilities: Capabilities,

    /// Overrides the global breaker settings for this backend
    #[serde(default)]
    pub breaker: Option<BreakerSettings>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Complete dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    pub routing: RoutingConfig,

    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl DispatchConfig {
    /// Build a config around a routing table with defaults elsewhere.
    pub fn new(routing: RoutingConfig) -> Self {
        Self {
            routing,
            backends: BTreeMap::new(),
            resilience: ResilienceConfig::default(),
            context: ContextConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Parse a config from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a config from JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a config file, choosing the format from its extension.
    ///
    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        validate_config_schema(&value).map_err(ConfigError::SchemaError)?;
        let config: DispatchConfig = serde_json::from_value(value)?;
        config.validate()?;
        tracing::debug!(
            backends = config.backends.len(),
            rules = config.routing.rules.len(),
            default_backend = %config.routing.default_backend,
            "Loaded dispatch config"
        );
        Ok(config)
    }

    /// Validate semantic constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.default_backend.trim().is_empty() {
            return Err(ConfigError::MissingField(
                "routing.default_backend".to_string(),
            ));
        }

        for (kind, backends) in &self.routing.rules {
            if backends.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Rule for '{}' lists no backends",
                    kind
                )));
            }
            let mut seen = HashSet::new();
            for name in backends {
                if !seen.insert(name) {
                    return Err(ConfigError::ValidationError(format!(
                        "Rule for '{}' lists '{}' twice",
                        kind, name
                    )));
                }
            }
        }

        // A declared backend table must cover every routed name
        if !self.backends.is_empty() {
            let routed = std::iter::once(&self.routing.default_backend)
                .chain(self.routing.rules.values().flatten());
            for name in routed {
                if !self.backends.contains_key(name) {
                    return Err(ConfigError::ValidationError(format!(
                        "Backend '{}' is routed to but not declared",
                        name
                    )));
                }
            }
        }

        validate_breaker("resilience.breaker", &self.resilience.breaker)?;
        for (name, backend) in &self.backends {
            if backend.capabilities.max_tokens == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "backends.{}.capabilities.max_tokens must be positive",
                    name
                )));
            }
            if let Some(breaker) = &backend.breaker {
                validate_breaker(&format!("backends.{}.breaker", name), breaker)?;
            }
        }

        let retry = &self.resilience.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "resilience.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if retry.base_delay > retry.max_delay {
            return Err(ConfigError::ValidationError(
                "resilience.retry.base_delay exceeds max_delay".to_string(),
            ));
        }
        if retry.deadline.is_zero() {
            return Err(ConfigError::ValidationError(
                "resilience.retry.deadline must be positive".to_string(),
            ));
        }

        let limit = &self.resilience.rate_limit;
        if limit.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "resilience.rate_limit.capacity must be positive".to_string(),
            ));
        }
        if !(limit.refill_rate.is_finite() && limit.refill_rate > 0.0) {
            return Err(ConfigError::ValidationError(
                "resilience.rate_limit.refill_rate must be a positive number".to_string(),
            ));
        }

        if self.context.call_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "context.call_timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Breaker settings for a backend, falling back to the global ones.
    pub fn breaker_for(&self, backend: &str) -> &BreakerSettings {
        self.backends
            .get(backend)
            .and_then(|b| b.breaker.as_ref())
            .unwrap_or(&self.resilience.breaker)
    }

    /// Rank of a backend in every rule list that names it.
    pub fn priority_rules_for(&self, backend: &str) -> Vec<PriorityRule> {
        self.routing
            .rules
            .iter()
            .filter_map(|(kind, backends)| {
                backends
                    .iter()
                    .position(|name| name == backend)
                    .map(|rank| PriorityRule { kind: *kind, rank })
            })
            .collect()
    }

    /// Descriptors for every enabled backend declared in this config.
    ///
    /// Health starts `Closed`; the runtime replaces it with the live breaker
    /// state before routing.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .filter(|(_, backend)| backend.enabled)
            .map(|(name, backend)| BackendDescriptor {
                name: name.clone(),
                capabilities: backend.capabilities.clone(),
                current_health: Default::default(),
                priority_rules: self.priority_rules_for(name),
            })
            .collect()
    }
}

fn validate_breaker(path: &str, breaker: &BreakerSettings) -> Result<(), ConfigError> {
    if breaker.failure_threshold == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}.failure_threshold must be positive",
            path
        )));
    }
    if breaker.cooldown.is_zero() || breaker.window.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{}.cooldown and window must be positive",
            path
        )));
    }
    Ok(())
}
