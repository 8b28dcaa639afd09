//! Dispatch orchestrator: the composition root.
//!
//! For every task the orchestrator:
//! 1. Spends one rate-limit token for the caller
//! 2. Loads or creates the conversation context
//! 3. Asks the router for ordered candidates, using live breaker health
//! 4. Calls candidates in order through the resilient invoker, each with a
//!    context window sized for that backend
//! 5. Appends the exchange to the context store
//!
//! Failover moves to the next candidate when a backend is unavailable
//! (circuit open, retries exhausted, deadline exceeded, upstream throttling,
//! auth or unknown failures). An invalid request stops immediately since no
//! other backend would accept it either.

use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use switchyard_core::{
    window, BackendCatalog, BackendDescriptor, ConfigError, ContextConfig,
    ConversationContext, DispatchConfig, Message, RouteError, Router, RoutingReason, Task,
    TokenUsage,
};

use crate::backends::{Backend, BackendRegistry, BackendResponse, ErrorCategory};
use crate::context::{ContextError, ContextStore, MemoryContextStore};
use crate::metrics::DispatchMetrics;
use crate::resilience::{InvocationError, ResilientInvoker};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What went wrong while handling a task.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    RateLimited { retry_after: Duration },
    CircuitOpen,
    RetriesExhausted { attempts: u32 },
    DeadlineExceeded,
    UnknownBackend,
    CapabilityMismatch { missing: Vec<&'static str> },
    NoBackends,
    VersionConflict { expected: u64, actual: u64 },
    Backend(ErrorCategory),
    ContextNotFound,
    Storage,
    Config,
    Metrics,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetriesExhausted { .. } => "retries_exhausted",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::UnknownBackend => "unknown_backend",
            ErrorKind::CapabilityMismatch { .. } => "capability_mismatch",
            ErrorKind::NoBackends => "no_backends",
            ErrorKind::VersionConflict { .. } => "version_conflict",
            ErrorKind::Backend(ErrorCategory::Transient) => "backend_transient",
            ErrorKind::Backend(ErrorCategory::RateLimited) => "backend_rate_limited",
            ErrorKind::Backend(ErrorCategory::AuthFailure) => "backend_auth_failure",
            ErrorKind::Backend(ErrorCategory::Invalid) => "backend_invalid",
            ErrorKind::Backend(ErrorCategory::Unknown) => "backend_unknown",
            ErrorKind::ContextNotFound => "context_not_found",
            ErrorKind::Storage => "storage_error",
            ErrorKind::Config => "config_error",
            ErrorKind::Metrics => "metrics_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimited { retry_after } => {
                write!(f, "Rate limit exceeded, retry after {:?}", retry_after)
            }
            ErrorKind::CircuitOpen => f.write_str("Backend is temporarily unavailable"),
            ErrorKind::RetriesExhausted { attempts } => {
                write!(f, "Backend failed after {} attempts", attempts)
            }
            ErrorKind::DeadlineExceeded => f.write_str("Request deadline exceeded"),
            ErrorKind::UnknownBackend => f.write_str("Requested backend is not registered"),
            ErrorKind::CapabilityMismatch { missing } => write!(
                f,
                "Requested backend lacks required capabilities: {}",
                missing.join(", ")
            ),
            ErrorKind::NoBackends => f.write_str("No backends are available"),
            ErrorKind::VersionConflict { .. } => {
                f.write_str("Conversation was modified concurrently, please retry")
            }
            ErrorKind::Backend(ErrorCategory::Transient) => f.write_str("Backend failed temporarily"),
            ErrorKind::Backend(ErrorCategory::RateLimited) => {
                f.write_str("Backend is throttling requests")
            }
            ErrorKind::Backend(ErrorCategory::AuthFailure) => {
                f.write_str("Backend rejected its credentials")
            }
            ErrorKind::Backend(ErrorCategory::Invalid) => {
                f.write_str("Backend rejected the request as invalid")
            }
            ErrorKind::Backend(ErrorCategory::Unknown) => f.write_str("Backend failed unexpectedly"),
            ErrorKind::ContextNotFound => f.write_str("Conversation not found"),
            ErrorKind::Storage => f.write_str("Conversation storage is unavailable"),
            ErrorKind::Config => f.write_str("Dispatch configuration is invalid"),
            ErrorKind::Metrics => f.write_str("Metrics registry could not be created"),
        }
    }
}

/// Error returned by [`Orchestrator::handle`].
///
/// `Display` and [`message`](Self::message) are safe to show to callers.
/// The underlying cause, which may contain upstream or storage detail, is
/// only reachable through [`std::error::Error::source`].
#[derive(Error, Debug)]
#[error("{kind}")]
pub struct OrchestrationError {
    pub kind: ErrorKind,

    /// Backend involved, if any
    pub backend: Option<String>,

    #[source]
    pub source: Option<BoxError>,
}

impl OrchestrationError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            backend: None,
            source: None,
        }
    }

    fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Human-readable message without internal detail.
    pub fn message(&self) -> String {
        match &self.backend {
            Some(backend) => format!("{} (backend: {})", self.kind, backend),
            None => self.kind.to_string(),
        }
    }
}

impl From<InvocationError> for OrchestrationError {
    fn from(e: InvocationError) -> Self {
        match &e {
            InvocationError::RateLimitExceeded { retry_after } => Self::new(ErrorKind::RateLimited {
                retry_after: *retry_after,
            }),
            InvocationError::CircuitOpen { backend } => {
                Self::new(ErrorKind::CircuitOpen).with_backend(backend.clone())
            }
            InvocationError::RetriesExhausted {
                backend, attempts, ..
            } => Self::new(ErrorKind::RetriesExhausted {
                attempts: *attempts,
            })
            .with_backend(backend.clone()),
            InvocationError::DeadlineExceeded { backend, .. } => {
                Self::new(ErrorKind::DeadlineExceeded).with_backend(backend.clone())
            }
            InvocationError::Backend { backend, error } => {
                Self::new(ErrorKind::Backend(error.category)).with_backend(backend.clone())
            }
        }
        .with_source(e)
    }
}

impl From<RouteError> for OrchestrationError {
    fn from(e: RouteError) -> Self {
        match &e {
            RouteError::UnknownBackend(backend) => {
                Self::new(ErrorKind::UnknownBackend).with_backend(backend.clone())
            }
            RouteError::CapabilityMismatch { backend, missing } => {
                Self::new(ErrorKind::CapabilityMismatch {
                    missing: missing.clone(),
                })
                .with_backend(backend.clone())
            }
            RouteError::NoBackendsRegistered => Self::new(ErrorKind::NoBackends),
        }
        .with_source(e)
    }
}

impl From<ContextError> for OrchestrationError {
    fn from(e: ContextError) -> Self {
        let kind = match &e {
            ContextError::VersionConflict { expected, actual } => ErrorKind::VersionConflict {
                expected: *expected,
                actual: *actual,
            },
            ContextError::NotFound(_) => ErrorKind::ContextNotFound,
            ContextError::Storage(_) | ContextError::Corrupt(_) => ErrorKind::Storage,
        };
        Self::new(kind).with_source(e)
    }
}

impl From<prometheus::Error> for OrchestrationError {
    fn from(e: prometheus::Error) -> Self {
        Self::new(ErrorKind::Metrics).with_source(e)
    }
}

impl From<ConfigError> for OrchestrationError {
    fn from(e: ConfigError) -> Self {
        Self::new(ErrorKind::Config).with_source(e)
    }
}

/// Result of a successfully handled task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResponse {
    pub content: String,

    /// Backend that produced the content
    pub backend: String,

    pub model: String,

    pub usage: TokenUsage,

    pub conversation_id: String,

    /// Stored context version after the exchange was appended
    pub version: u64,

    /// Why the serving backend was a candidate
    pub reason: RoutingReason,
}

/// Health of one registered backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,

    /// Result of the backend's own liveness check
    pub reachable: bool,
}

/// Routes tasks to backends and keeps conversation context.
///
/// Share one instance per process behind an `Arc`.
pub struct Orchestrator {
    config: DispatchConfig,
    router: Router,
    registry: BackendRegistry,
    invoker: ResilientInvoker,
    store: Arc<dyn ContextStore>,
    metrics: Arc<DispatchMetrics>,
}

impl Orchestrator {
    pub fn builder(config: DispatchConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn invoker(&self) -> &ResilientInvoker {
        &self.invoker
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    fn context_config(&self) -> &ContextConfig {
        &self.config.context
    }

    /// Catalog snapshot: every enabled registered backend with its live
    /// breaker health.
    ///
    /// Capabilities declared in configuration take precedence over what the
    /// backend advertises.
    pub fn catalog(&self) -> BackendCatalog {
        self.registry
            .iter()
            .filter_map(|(name, backend)| {
                let declared = self.config.backends.get(name);
                if declared.is_some_and(|b| !b.enabled) {
                    return None;
                }
                let capabilities = declared
                    .map(|b| b.capabilities.clone())
                    .unwrap_or_else(|| backend.capabilities());
                Some(BackendDescriptor {
                    name: name.to_string(),
                    capabilities,
                    current_health: self.invoker.health(name),
                    priority_rules: self.config.priority_rules_for(name),
                })
            })
            .collect()
    }

    /// Health-check every registered backend and report its breaker state.
    pub async fn health_report(&self) -> Vec<BackendHealth> {
        let catalog = self.catalog();
        let checks = catalog.iter().filter_map(|descriptor| {
            let backend = self.registry.get(&descriptor.name)?;
            Some(async move {
                BackendHealth {
                    descriptor: descriptor.clone(),
                    reachable: backend.health_check().await,
                }
            })
        });
        join_all(checks).await
    }

    /// Handle one task for `caller`.
    pub async fn handle(
        &self,
        caller: &str,
        task: &Task,
    ) -> Result<DispatchResponse, OrchestrationError> {
        let _active = self.metrics.track_active();
        let result = self.dispatch(caller, task).await;
        if let Err(e) = &result {
            self.metrics.record_task_error(e.code());
        }
        result
    }

    async fn dispatch(
        &self,
        caller: &str,
        task: &Task,
    ) -> Result<DispatchResponse, OrchestrationError> {
        self.invoker.admit(caller)?;

        let conversation_id = task
            .conversation_id()
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let context = self
            .store
            .get_or_create(&conversation_id, task.project_id())
            .await?;

        let decision = self.router.route(task, &self.catalog())?;

        let mut last_error = None;
        for name in &decision.ordered_candidates {
            let Some(backend) = self.registry.get(name) else {
                continue;
            };

            match self.call_backend(backend.as_ref(), &context, task).await {
                Ok(response) => {
                    let stored = self.persist(&context, task, &response).await?;
                    tracing::info!(
                        task_id = %task.id(),
                        backend = %name,
                        conversation_id = %conversation_id,
                        version = stored.version,
                        "Task dispatched"
                    );
                    return Ok(DispatchResponse {
                        content: response.content,
                        backend: name.clone(),
                        model: response.model,
                        usage: response.usage,
                        conversation_id,
                        version: stored.version,
                        reason: decision.reason,
                    });
                }
                Err(e) if should_fail_over(&e) => {
                    tracing::warn!(
                        task_id = %task.id(),
                        backend = %name,
                        error = %e,
                        "Backend unavailable, failing over"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error
            .map(OrchestrationError::from)
            .unwrap_or_else(|| OrchestrationError::new(ErrorKind::NoBackends)))
    }

    async fn call_backend(
        &self,
        backend: &dyn Backend,
        context: &ConversationContext,
        task: &Task,
    ) -> Result<BackendResponse, InvocationError> {
        let budget = self
            .context_config()
            .window_budget(&backend.capabilities());
        let windowed = window(context, budget);

        let started = tokio::time::Instant::now();
        let outcome = self
            .invoker
            .call(backend.name(), self.context_config().call_timeout, || {
                backend.send(&windowed, task)
            })
            .await;
        self.metrics
            .record_call(backend.name(), started.elapsed(), &outcome);
        outcome
    }

    /// Append the user message and the reply as one exchange.
    ///
    /// Both messages land together or not at all. A version conflict means
    /// another writer got in first; the exchange is re-applied once on top of
    /// the fresh version and a second conflict is returned.
    async fn persist(
        &self,
        context: &ConversationContext,
        task: &Task,
        response: &BackendResponse,
    ) -> Result<ConversationContext, OrchestrationError> {
        let id = &context.conversation_id;
        let exchange = vec![
            Message::user(task.payload()),
            Message::assistant(response.content.clone()),
        ];

        match self
            .store
            .append_all(id, exchange.clone(), context.version)
            .await
        {
            Err(ContextError::VersionConflict { expected, actual }) => {
                tracing::debug!(
                    conversation_id = %id,
                    expected,
                    actual,
                    "Re-applying exchange after version conflict"
                );
                let fresh = self
                    .store
                    .load(id)
                    .await?
                    .ok_or_else(|| ContextError::NotFound(id.clone()))?;
                Ok(self.store.append_all(id, exchange, fresh.version).await?)
            }
            other => Ok(other?),
        }
    }
}

/// Whether a failed candidate should hand over to the next one.
fn should_fail_over(error: &InvocationError) -> bool {
    match error {
        InvocationError::CircuitOpen { .. }
        | InvocationError::RetriesExhausted { .. }
        | InvocationError::DeadlineExceeded { .. } => true,
        InvocationError::Backend { error, .. } => matches!(
            error.category,
            ErrorCategory::RateLimited | ErrorCategory::AuthFailure | ErrorCategory::Unknown
        ),
        InvocationError::RateLimitExceeded { .. } => false,
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: DispatchConfig,
    registry: BackendRegistry,
    store: Option<Arc<dyn ContextStore>>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl OrchestratorBuilder {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            registry: BackendRegistry::new(),
            store: None,
            metrics: None,
        }
    }

    /// Register a backend.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.registry.register(backend);
        self
    }

    /// Use an existing registry, replacing any backends added so far.
    pub fn registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the context store. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Record into an existing collector. Defaults to a fresh registry.
    pub fn metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Result<Orchestrator, OrchestrationError> {
        self.config.validate()?;

        for name in self.config.backends.keys() {
            if !self.registry.contains(name) {
                tracing::warn!(backend = %name, "Configured backend has no registered adapter");
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryContextStore::new()));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(DispatchMetrics::new()?),
        };

        Ok(Orchestrator {
            router: Router::new(self.config.routing.clone()),
            invoker: ResilientInvoker::from_config(&self.config),
            registry: self.registry,
            store,
            metrics,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use switchyard_core::{Capabilities, CircuitState, Requirements, RoutingConfig, TaskKind};

    /// Backend replaying scripted outcomes, then succeeding.
    struct ScriptedBackend {
        name: &'static str,
        capabilities: Capabilities,
        script: Mutex<VecDeque<Result<(), BackendError>>>,
        calls: AtomicU32,
        last_window_len: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                capabilities: Capabilities {
                    streaming: true,
                    code_context: true,
                    max_tokens: 100_000,
                },
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                last_window_len: AtomicU32::new(0),
            }
        }

        fn failing(name: &'static str, error: BackendError, times: usize) -> Self {
            let backend = Self::new(name);
            backend
                .script
                .lock()
                .extend(std::iter::repeat(Err(error)).take(times));
            backend
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities.clone()
        }

        async fn send(
            &self,
            window: &ConversationContext,
            task: &Task,
        ) -> Result<BackendResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_window_len
                .store(window.messages.len() as u32, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or(Ok(()))?;
            Ok(BackendResponse {
                content: format!("{} says: {}", self.name, task.payload()),
                model: format!("{}-model", self.name),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                },
            })
        }
    }

    fn config() -> DispatchConfig {
        let mut config = DispatchConfig::new(
            RoutingConfig::new("gpt").with_rule(TaskKind::CodeEdit, ["claude", "gpt"]),
        );
        config.resilience.retry.max_attempts = 2;
        config.resilience.retry.base_delay = Duration::from_millis(10);
        config.resilience.breaker.failure_threshold = 2;
        config
    }

    fn orchestrator(backends: Vec<Arc<ScriptedBackend>>) -> Orchestrator {
        let mut builder = Orchestrator::builder(config());
        for backend in backends {
            builder = builder.backend(backend);
        }
        builder.build().unwrap()
    }

    fn code_edit(conversation: &str) -> Task {
        Task::new("Fix the failing test in router.rs").with_conversation(conversation)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_to_first_candidate_and_persist() {
        let claude = Arc::new(ScriptedBackend::new("claude"));
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let orch = orchestrator(vec![claude.clone(), gpt.clone()]);

        let response = orch.handle("alice", &code_edit("c1")).await.unwrap();

        assert_eq!(response.backend, "claude");
        assert_eq!(response.model, "claude-model");
        assert_eq!(response.usage.total(), 15);
        assert_eq!(response.conversation_id, "c1");
        assert_eq!(response.version, 2);
        assert_eq!(response.reason, RoutingReason::Rule(TaskKind::CodeEdit));
        assert_eq!(gpt.calls(), 0);

        let stored = orch.store().load("c1").await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].content, "Fix the failing test in router.rs");
        assert!(stored.messages[1].content.starts_with("claude says"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_retries_exhausted() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::transient("503"),
            10,
        ));
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let orch = orchestrator(vec![claude.clone(), gpt.clone()]);

        let response = orch.handle("alice", &code_edit("c1")).await.unwrap();

        assert_eq!(response.backend, "gpt");
        assert_eq!(claude.calls(), 2);
        assert_eq!(gpt.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_routed_around() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::transient("503"),
            10,
        ));
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let orch = orchestrator(vec![claude.clone(), gpt.clone()]);

        // Two failed attempts open claude's circuit
        orch.handle("alice", &code_edit("c1")).await.unwrap();
        assert_eq!(orch.invoker().health("claude"), CircuitState::Open);

        let response = orch.handle("alice", &code_edit("c1")).await.unwrap();
        assert_eq!(response.backend, "gpt");
        assert_eq!(claude.calls(), 2);
        assert_eq!(response.version, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_stops_failover() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::invalid("prompt too long"),
            1,
        ));
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let orch = orchestrator(vec![claude.clone(), gpt.clone()]);

        let err = orch.handle("alice", &code_edit("c1")).await.unwrap_err();

        assert_eq!(err.code(), "backend_invalid");
        assert_eq!(err.backend.as_deref(), Some("claude"));
        assert_eq!(gpt.calls(), 0);
        assert!(!err.message().contains("prompt too long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_fails_over() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::auth_failure("401"),
            1,
        ));
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let orch = orchestrator(vec![claude.clone(), gpt.clone()]);

        let response = orch.handle("alice", &code_edit("c1")).await.unwrap();
        assert_eq!(response.backend, "gpt");
        assert_eq!(claude.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_failing_returns_last_error() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::unknown("boom"),
            1,
        ));
        let gpt = Arc::new(ScriptedBackend::failing(
            "gpt",
            BackendError::rate_limited("429"),
            1,
        ));
        let orch = orchestrator(vec![claude, gpt]);

        let err = orch.handle("alice", &code_edit("c1")).await.unwrap_err();
        assert_eq!(err.code(), "backend_rate_limited");
        assert_eq!(err.backend.as_deref(), Some("gpt"));

        // Nothing persisted for a failed task
        let stored = orch.store().load("c1").await.unwrap().unwrap();
        assert!(stored.messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_caller_is_rejected() {
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let mut config = config();
        config.resilience.rate_limit.capacity = 1;
        let orch = Orchestrator::builder(config)
            .backend(gpt.clone())
            .build()
            .unwrap();

        orch.handle("alice", &Task::new("hello")).await.unwrap();
        let err = orch.handle("alice", &Task::new("hello")).await.unwrap_err();

        assert_eq!(err.code(), "rate_limited");
        assert_eq!(gpt.calls(), 1);
        assert!(orch.handle("bob", &Task::new("hello")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_backend_errors_map_to_codes() {
        let orch = orchestrator(vec![Arc::new(ScriptedBackend::new("claude"))]);

        let unknown = orch
            .handle("alice", &Task::new("hi").with_backend("mistral"))
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), "unknown_backend");

        let mut weak = ScriptedBackend::new("weak");
        weak.capabilities.streaming = false;
        let orch = orchestrator(vec![Arc::new(weak)]);
        let mismatch = orch
            .handle(
                "alice",
                &Task::new("hi")
                    .with_backend("weak")
                    .with_requirements(Requirements {
                        streaming: true,
                        ..Default::default()
                    }),
            )
            .await
            .unwrap_err();
        assert_eq!(mismatch.code(), "capability_mismatch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backends_registered() {
        let orch = orchestrator(vec![]);
        let err = orch.handle("alice", &Task::new("hi")).await.unwrap_err();
        assert_eq!(err.code(), "no_backends");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_conversation_gets_generated_id() {
        let orch = orchestrator(vec![Arc::new(ScriptedBackend::new("gpt"))]);

        let first = orch.handle("alice", &Task::new("hi")).await.unwrap();
        let second = orch.handle("alice", &Task::new("hi")).await.unwrap();

        assert!(uuid::Uuid::parse_str(&first.conversation_id).is_ok());
        assert_ne!(first.conversation_id, second.conversation_id);
        assert_eq!(first.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_sized_to_backend() {
        let mut small = ScriptedBackend::new("gpt");
        // 1200 - 1000 reserved leaves a 200 token window
        small.capabilities.max_tokens = 1200;
        let small = Arc::new(small);
        let orch = orchestrator(vec![small.clone()]);

        let store = orch.store();
        let mut version = store.get_or_create("c1", None).await.unwrap().version;
        for i in 0..5 {
            // 4 + 96 = 100 tokens each
            let content = format!("{:02}{}", i, "x".repeat(382));
            version = store
                .append("c1", Message::user(content), version)
                .await
                .unwrap()
                .version;
        }

        orch.handle("alice", &Task::new("hi").with_conversation("c1"))
            .await
            .unwrap();

        assert_eq!(small.last_window_len.load(Ordering::SeqCst), 2);
        assert_eq!(store.load("c1").await.unwrap().unwrap().messages.len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_backend_is_not_routed() {
        let mut config = config();
        config.backends.insert(
            "claude".to_string(),
            switchyard_core::BackendConfig {
                capabilities: Capabilities::default(),
                breaker: None,
                enabled: false,
            },
        );
        config.backends.insert(
            "gpt".to_string(),
            switchyard_core::BackendConfig {
                capabilities: Capabilities::default(),
                breaker: None,
                enabled: true,
            },
        );
        let claude = Arc::new(ScriptedBackend::new("claude"));
        let orch = Orchestrator::builder(config)
            .backend(claude.clone())
            .backend(Arc::new(ScriptedBackend::new("gpt")))
            .build()
            .unwrap();

        let response = orch.handle("alice", &code_edit("c1")).await.unwrap();
        assert_eq!(response.backend, "gpt");
        assert_eq!(claude.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_report_includes_breaker_state() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::transient("503"),
            10,
        ));
        let orch = orchestrator(vec![claude, Arc::new(ScriptedBackend::new("gpt"))]);
        orch.handle("alice", &code_edit("c1")).await.unwrap();

        let report = orch.health_report().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].descriptor.name, "claude");
        assert_eq!(report[0].descriptor.current_health, CircuitState::Open);
        assert_eq!(report[1].descriptor.current_health, CircuitState::Closed);
        assert!(report.iter().all(|h| h.reachable));
    }

    #[tokio::test]
    async fn test_concurrent_writer_triggers_single_reapply() {
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let orch = orchestrator(vec![gpt]);
        let store = orch.store().clone();
        let context = store.get_or_create("c1", None).await.unwrap();

        // Someone else appends after we loaded the context
        store
            .append("c1", Message::user("interleaved"), context.version)
            .await
            .unwrap();

        let response = BackendResponse {
            content: "reply".to_string(),
            model: "m".to_string(),
            usage: TokenUsage::default(),
        };
        let stored = orch
            .persist(&context, &Task::new("mine").with_conversation("c1"), &response)
            .await
            .unwrap();

        assert_eq!(stored.version, 3);
        let contents: Vec<_> = stored.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["interleaved", "mine", "reply"]);
    }

    /// Store that slips a foreign write in before the listed `append_all` calls.
    struct InterleavingStore {
        inner: MemoryContextStore,
        interleave_on: Vec<usize>,
        appends: AtomicUsize,
    }

    #[async_trait]
    impl ContextStore for InterleavingStore {
        async fn get_or_create(
            &self,
            conversation_id: &str,
            project_id: Option<&str>,
        ) -> Result<ConversationContext, ContextError> {
            self.inner.get_or_create(conversation_id, project_id).await
        }

        async fn append_all(
            &self,
            conversation_id: &str,
            messages: Vec<Message>,
            expected_version: u64,
        ) -> Result<ConversationContext, ContextError> {
            let call = self.appends.fetch_add(1, Ordering::SeqCst);
            if self.interleave_on.contains(&call) {
                let current = self.inner.load(conversation_id).await?.unwrap();
                self.inner
                    .append(conversation_id, Message::user("foreign"), current.version)
                    .await?;
            }
            self.inner
                .append_all(conversation_id, messages, expected_version)
                .await
        }

        async fn load(
            &self,
            conversation_id: &str,
        ) -> Result<Option<ConversationContext>, ContextError> {
            self.inner.load(conversation_id).await
        }
    }

    fn interleaving(interleave_on: Vec<usize>) -> (Orchestrator, Arc<InterleavingStore>) {
        let store = Arc::new(InterleavingStore {
            inner: MemoryContextStore::new(),
            interleave_on,
            appends: AtomicUsize::new(0),
        });
        let orch = Orchestrator::builder(config())
            .backend(Arc::new(ScriptedBackend::new("gpt")))
            .store(store.clone())
            .build()
            .unwrap();
        (orch, store)
    }

    async fn contents(store: &dyn ContextStore, id: &str) -> Vec<String> {
        store
            .load(id)
            .await
            .unwrap()
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_reapplied_whole_after_interleaved_write() {
        let (orch, store) = interleaving(vec![0]);

        let response = orch
            .handle("alice", &Task::new("hello").with_conversation("c1"))
            .await
            .unwrap();

        assert_eq!(response.version, 3);
        assert_eq!(
            contents(store.as_ref(), "c1").await,
            vec!["foreign", "hello", "gpt says: hello"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_conflict_leaves_no_partial_exchange() {
        let (orch, store) = interleaving(vec![0, 1]);

        let err = orch
            .handle("alice", &Task::new("hello").with_conversation("c1"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "version_conflict");
        assert_eq!(
            contents(store.as_ref(), "c1").await,
            vec!["foreign", "foreign"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_track_calls_and_task_errors() {
        let claude = Arc::new(ScriptedBackend::failing(
            "claude",
            BackendError::transient("503"),
            10,
        ));
        let gpt = Arc::new(ScriptedBackend::new("gpt"));
        let mut config = config();
        config.resilience.rate_limit.capacity = 1;
        let orch = Orchestrator::builder(config)
            .backend(claude)
            .backend(gpt)
            .build()
            .unwrap();

        orch.handle("alice", &code_edit("c1")).await.unwrap();
        orch.handle("alice", &code_edit("c1")).await.unwrap_err();

        let metrics = orch.metrics();
        let claude = metrics.stats("claude");
        assert_eq!(claude.calls, 1);
        assert_eq!(claude.failures, 1);
        assert_eq!(metrics.call_errors("claude", "retries_exhausted"), 1);

        let gpt = metrics.stats("gpt");
        assert_eq!(gpt.successes, 1);
        assert_eq!(gpt.prompt_tokens, 10);
        assert_eq!(gpt.completion_tokens, 5);

        assert_eq!(metrics.task_errors("rate_limited"), 1);
        assert_eq!(metrics.active_tasks(), 0);

        let text = metrics.export().unwrap();
        assert!(text.contains("switchyard_backend_call_duration_seconds"));
        assert!(text.contains("switchyard_active_tasks 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_metrics_collector() {
        let metrics = Arc::new(DispatchMetrics::new().unwrap());
        let orch = Orchestrator::builder(config())
            .backend(Arc::new(ScriptedBackend::new("gpt")))
            .metrics(metrics.clone())
            .build()
            .unwrap();

        orch.handle("alice", &Task::new("hello")).await.unwrap();

        assert_eq!(metrics.stats("gpt").successes, 1);
    }

    #[test]
    fn test_error_codes_are_stable() {
        let err = OrchestrationError::from(InvocationError::RetriesExhausted {
            backend: "claude".to_string(),
            attempts: 3,
            last_error: BackendError::transient("SELECT * FROM secrets"),
        });
        assert_eq!(err.code(), "retries_exhausted");
        assert_eq!(err.message(), "Backend failed after 3 attempts (backend: claude)");
        assert!(std::error::Error::source(&err).is_some());

        let err = OrchestrationError::from(ContextError::NotFound("c9".to_string()));
        assert_eq!(err.code(), "context_not_found");
        assert!(!err.message().contains("c9"));
    }
}
