//! Core data types shared by the router, the resilience layer and the
//! orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::classify;

/// Classification tag for a task.
///
/// Derived from the payload by [`TaskKind::classify`]; callers never
/// supply it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    CodeEdit,
    CodeGeneration,
    Research,
    TerminalAutomation,
    GeneralChat,
}

impl TaskKind {
    /// All kinds, in classification priority order.
    pub const ALL: [TaskKind; 5] = [
        TaskKind::CodeEdit,
        TaskKind::Research,
        TaskKind::TerminalAutomation,
        TaskKind::CodeGeneration,
        TaskKind::GeneralChat,
    ];

    /// Classify a free-form instruction.
    pub fn classify(payload: &str) -> Self {
        classify::classify(payload)
    }

    /// Stable tag used in configuration rule tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CodeEdit => "code-edit",
            TaskKind::CodeGeneration => "code-generation",
            TaskKind::Research => "research",
            TaskKind::TerminalAutomation => "terminal-automation",
            TaskKind::GeneralChat => "general-chat",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown task kind: '{}'", s))
    }
}

/// Capabilities a task needs from whichever backend serves it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Response must be streamed
    pub streaming: bool,

    /// Backend must accept code context
    pub code_context: bool,

    /// Minimum context window the backend must offer
    pub min_context_tokens: Option<u32>,
}

/// A unit of work submitted by a caller.
///
/// Immutable once built: the builder methods consume `self` and only
/// exist for construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    id: String,
    kind: TaskKind,
    payload: String,
    conversation_id: Option<String>,
    project_id: Option<String>,
    explicit_backend: Option<String>,
    requirements: Requirements,
}

impl Task {
    /// Create a task from a payload, classifying it and assigning a fresh id.
    pub fn new(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: TaskKind::classify(&payload),
            payload,
            conversation_id: None,
            project_id: None,
            explicit_backend: None,
            requirements: Requirements::default(),
        }
    }

    /// Use a caller-chosen task id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Bypass classification and route to a named backend.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.explicit_backend = Some(backend.into());
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn explicit_backend(&self) -> Option<&str> {
        self.explicit_backend.as_deref()
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }
}

/// Static capabilities of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Supports streamed responses
    #[serde(default)]
    pub streaming: bool,

    /// Accepts code context alongside the prompt
    #[serde(default)]
    pub code_context: bool,

    /// Context window size in tokens
    pub max_tokens: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: false,
            code_context: false,
            max_tokens: 8192,
        }
    }
}

impl Capabilities {
    /// Whether these capabilities satisfy every requirement.
    pub fn satisfies(&self, requirements: &Requirements) -> bool {
        self.missing(requirements).is_empty()
    }

    /// Names of the requirements these capabilities do not meet.
    pub fn missing(&self, requirements: &Requirements) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if requirements.streaming && !self.streaming {
            missing.push("streaming");
        }
        if requirements.code_context && !self.code_context {
            missing.push("code-context");
        }
        if let Some(min) = requirements.min_context_tokens {
            if self.max_tokens < min {
                missing.push("max-tokens");
            }
        }
        missing
    }
}

/// Health of a backend as seen by its circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,

    /// Calls fail fast
    Open,

    /// A single trial call is allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Metadata about one upstream backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique registry key
    pub name: String,

    pub capabilities: Capabilities,

    /// Snapshot of the backend's breaker state
    #[serde(default)]
    pub current_health: CircuitState,

    /// This backend's rank in each rule list that names it
    #[serde(default)]
    pub priority_rules: Vec<PriorityRule>,
}

/// Position of a backend within one task kind's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRule {
    pub kind: TaskKind,

    /// 0 is most preferred
    pub rank: usize,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            current_health: CircuitState::Closed,
            priority_rules: Vec::new(),
        }
    }

    /// Replace the health snapshot.
    pub fn with_health(mut self, health: CircuitState) -> Self {
        self.current_health = health;
        self
    }
}

/// Why the router produced a given ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "kind")]
pub enum RoutingReason {
    /// The task named its backend
    ExplicitOverride,

    /// A rule table entry for the task kind matched
    Rule(TaskKind),

    /// No rule for the kind, the default backend was used
    Default,

    /// Health/capability filtering removed every candidate
    DegradedFallback,

    /// Neither rules nor the default named a registered backend
    RegistryFallback,
}

impl fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingReason::ExplicitOverride => f.write_str("explicit-override"),
            RoutingReason::Rule(kind) => write!(f, "rule:{}", kind),
            RoutingReason::Default => f.write_str("default"),
            RoutingReason::DegradedFallback => f.write_str("degraded-fallback"),
            RoutingReason::RegistryFallback => f.write_str("registry-fallback"),
        }
    }
}

/// The router's output for one task. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Backend names, most preferred first. Never empty.
    pub ordered_candidates: Vec<String>,

    pub reason: RoutingReason,
}

/// Token usage reported by a backend for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}
