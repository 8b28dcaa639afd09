//! Router: maps a task to an ordered list of candidate backends.
//!
//! Routing is a pure function of the task, the rule table and a catalog
//! snapshot. The rules applied, in order:
//! 1. An explicit backend on the task wins, provided it is registered and
//!    capable. Health is left to the circuit breaker.
//! 2. The rule list for the task kind, else `[default_backend]`, with
//!    unregistered names dropped.
//! 3. If nothing registered remains: the default backend, else every
//!    registered backend in name order.
//! 4. Candidates whose breaker is open or whose capabilities fall short are
//!    filtered out, unless that would leave nothing, in which case the
//!    unfiltered list is returned as a degraded fallback.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::RoutingConfig;
use crate::types::{
    BackendDescriptor, CircuitState, RoutingDecision, RoutingReason, Task, TaskKind,
};

/// Errors that can occur when routing a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Backend '{0}' is not registered")]
    UnknownBackend(String),

    #[error("Backend '{backend}' lacks required capabilities: {}", .missing.join(", "))]
    CapabilityMismatch {
        backend: String,
        missing: Vec<&'static str>,
    },

    #[error("No backends are registered")]
    NoBackendsRegistered,
}

/// Snapshot of every registered backend, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendCatalog {
    backends: BTreeMap<String, BackendDescriptor>,
}

impl BackendCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor, replacing any with the same name.
    pub fn insert(&mut self, descriptor: BackendDescriptor) {
        self.backends.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&BackendDescriptor> {
        self.backends.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.values()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

impl FromIterator<BackendDescriptor> for BackendCatalog {
    fn from_iter<I: IntoIterator<Item = BackendDescriptor>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for descriptor in iter {
            catalog.insert(descriptor);
        }
        catalog
    }
}

/// Rule-based backend selection.
#[derive(Debug, Clone)]
pub struct Router {
    default_backend: String,
    rules: BTreeMap<TaskKind, Vec<String>>,
}

impl Router {
    pub fn new(routing: RoutingConfig) -> Self {
        Self {
            default_backend: routing.default_backend,
            rules: routing.rules,
        }
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    /// Preference list configured for a kind, if any.
    pub fn rule_for(&self, kind: TaskKind) -> Option<&[String]> {
        self.rules.get(&kind).map(Vec::as_slice)
    }

    /// Choose the ordered candidate backends for a task.
    pub fn route(
        &self,
        task: &Task,
        catalog: &BackendCatalog,
    ) -> Result<RoutingDecision, RouteError> {
        if let Some(name) = task.explicit_backend() {
            return Self::route_explicit(name, task, catalog);
        }

        if catalog.is_empty() {
            return Err(RouteError::NoBackendsRegistered);
        }

        let (preferred, mut reason) = match self.rules.get(&task.kind()) {
            Some(list) => (list.as_slice(), RoutingReason::Rule(task.kind())),
            None => (
                std::slice::from_ref(&self.default_backend),
                RoutingReason::Default,
            ),
        };

        let mut candidates: Vec<&BackendDescriptor> =
            preferred.iter().filter_map(|name| catalog.get(name)).collect();

        if candidates.is_empty() {
            match catalog.get(&self.default_backend) {
                Some(default) => {
                    candidates.push(default);
                    reason = RoutingReason::Default;
                }
                None => {
                    candidates.extend(catalog.iter());
                    reason = RoutingReason::RegistryFallback;
                }
            }
        }

        let healthy: Vec<&BackendDescriptor> = candidates
            .iter()
            .copied()
            .filter(|d| {
                d.current_health != CircuitState::Open
                    && d.capabilities.satisfies(task.requirements())
            })
            .collect();

        let ordered = if healthy.is_empty() {
            tracing::warn!(
                task_id = %task.id(),
                kind = %task.kind(),
                candidates = candidates.len(),
                "No healthy capable backend, falling back to unfiltered candidates"
            );
            reason = RoutingReason::DegradedFallback;
            candidates
        } else {
            healthy
        };

        let decision = RoutingDecision {
            ordered_candidates: ordered.iter().map(|d| d.name.clone()).collect(),
            reason,
        };

        tracing::debug!(
            task_id = %task.id(),
            kind = %task.kind(),
            reason = %decision.reason,
            candidates = ?decision.ordered_candidates,
            "Routed task"
        );

        Ok(decision)
    }

    fn route_explicit(
        name: &str,
        task: &Task,
        catalog: &BackendCatalog,
    ) -> Result<RoutingDecision, RouteError> {
        let descriptor = catalog
            .get(name)
            .ok_or_else(|| RouteError::UnknownBackend(name.to_string()))?;

        let missing = descriptor.capabilities.missing(task.requirements());
        if !missing.is_empty() {
            return Err(RouteError::CapabilityMismatch {
                backend: name.to_string(),
                missing,
            });
        }

        Ok(RoutingDecision {
            ordered_candidates: vec![name.to_string()],
            reason: RoutingReason::ExplicitOverride,
        })
    }
}
