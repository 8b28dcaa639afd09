//! Circuit breakers to prevent cascade failures.
//!
//! When a backend fails repeatedly within a sliding window, its circuit
//! opens and calls fail fast until the cooldown elapses. The next admission
//! after the cooldown becomes the single half-open trial; its outcome closes
//! or re-opens the circuit.
//!
//! Admission hands out a [`BreakerPermit`]. Each permit remembers the state
//! generation it was issued under, so a call that started while Closed and
//! finishes after the circuit opened cannot count twice.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::time::Instant;

use switchyard_core::{BreakerSettings, CircuitState, DispatchConfig};

/// Admission refused because the circuit is open or its trial is in flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit open for backend '{backend}'")]
pub struct CircuitOpen {
    pub backend: String,
}

#[derive(Debug, Clone)]
enum Phase {
    /// Failure timestamps inside the sliding window
    Closed { failures: VecDeque<Instant> },

    Open { opened_at: Instant },

    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug, Clone)]
struct BreakerState {
    phase: Phase,

    /// Bumped on every state transition
    generation: u64,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            phase: Phase::Closed {
                failures: VecDeque::new(),
            },
            generation: 0,
        }
    }

    fn transition(&mut self, phase: Phase) {
        self.phase = phase;
        self.generation += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

/// Per-backend circuit breakers behind one lock.
pub struct CircuitBreakers {
    states: Mutex<HashMap<String, BreakerState>>,
    defaults: BreakerSettings,
    overrides: HashMap<String, BreakerSettings>,
}

impl CircuitBreakers {
    /// Create breakers that all share the same settings.
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            defaults,
            overrides: HashMap::new(),
        }
    }

    /// Create breakers with the global settings and per-backend overrides
    /// from a dispatch config.
    pub fn from_config(config: &DispatchConfig) -> Self {
        let overrides = config
            .backends
            .iter()
            .filter_map(|(name, backend)| backend.breaker.clone().map(|b| (name.clone(), b)))
            .collect();
        Self {
            states: Mutex::new(HashMap::new()),
            defaults: config.resilience.breaker.clone(),
            overrides,
        }
    }

    /// Use specific settings for one backend.
    pub fn with_override(mut self, backend: impl Into<String>, settings: BreakerSettings) -> Self {
        self.overrides.insert(backend.into(), settings);
        self
    }

    /// Settings in effect for a backend.
    pub fn settings(&self, backend: &str) -> &BreakerSettings {
        self.overrides.get(backend).unwrap_or(&self.defaults)
    }

    /// Ask to make one call to `backend`.
    pub fn acquire(&self, backend: &str) -> Result<BreakerPermit<'_>, CircuitOpen> {
        self.acquire_at(backend, Instant::now())
    }

    pub fn acquire_at(&self, backend: &str, now: Instant) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let settings = self.settings(backend);
        let mut states = self.states.lock();
        let state = states
            .entry(backend.to_string())
            .or_insert_with(BreakerState::closed);

        let kind = match &mut state.phase {
            Phase::Closed { .. } => PermitKind::Normal,
            Phase::HalfOpen { trial_in_flight } if !*trial_in_flight => {
                *trial_in_flight = true;
                PermitKind::Trial
            }
            Phase::Open { opened_at }
                if now.saturating_duration_since(*opened_at) >= settings.cooldown =>
            {
                PermitKind::Trial
            }
            _ => {
                return Err(CircuitOpen {
                    backend: backend.to_string(),
                })
            }
        };

        if matches!(state.phase, Phase::Open { .. }) {
            state.transition(Phase::HalfOpen {
                trial_in_flight: true,
            });
            tracing::info!(backend = %backend, "Circuit half-open, admitting trial");
        }

        Ok(BreakerPermit {
            breakers: self,
            backend: backend.to_string(),
            generation: state.generation,
            kind,
            settled: false,
        })
    }

    /// Health as seen by the router.
    ///
    /// An open circuit whose cooldown has elapsed reports `HalfOpen`, since
    /// the next admission will be a trial.
    pub fn state(&self, backend: &str) -> CircuitState {
        self.state_at(backend, Instant::now())
    }

    pub fn state_at(&self, backend: &str, now: Instant) -> CircuitState {
        let states = self.states.lock();
        match states.get(backend).map(|s| &s.phase) {
            None | Some(Phase::Closed { .. }) => CircuitState::Closed,
            Some(Phase::HalfOpen { .. }) => CircuitState::HalfOpen,
            Some(Phase::Open { opened_at }) => {
                if now.saturating_duration_since(*opened_at) >= self.settings(backend).cooldown {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    /// Reset every circuit to closed.
    pub fn reset(&self) {
        self.states.lock().clear();
    }

    fn settle(&self, permit: &BreakerPermit<'_>, success: bool, now: Instant) {
        let settings = self.settings(&permit.backend);
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&permit.backend) else {
            return;
        };
        if state.generation != permit.generation {
            tracing::trace!(backend = %permit.backend, "Ignoring outcome from stale permit");
            return;
        }

        let next = match (&mut state.phase, permit.kind) {
            (Phase::Closed { failures }, PermitKind::Normal) if !success => {
                failures.push_back(now);
                while failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > settings.window)
                {
                    failures.pop_front();
                }
                let count = failures.len();
                if count >= settings.failure_threshold as usize {
                    tracing::warn!(
                        backend = %permit.backend,
                        failures = count,
                        "Circuit opened after repeated failures"
                    );
                    Some(Phase::Open { opened_at: now })
                } else {
                    None
                }
            }
            (Phase::HalfOpen { .. }, PermitKind::Trial) if success => {
                tracing::info!(backend = %permit.backend, "Circuit closed after successful trial");
                Some(Phase::Closed {
                    failures: VecDeque::new(),
                })
            }
            (Phase::HalfOpen { .. }, PermitKind::Trial) => {
                tracing::warn!(backend = %permit.backend, "Circuit reopened after failed trial");
                Some(Phase::Open { opened_at: now })
            }
            _ => None,
        };

        if let Some(phase) = next {
            state.transition(phase);
        }
    }

    fn release_trial(&self, permit: &BreakerPermit<'_>) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&permit.backend) {
            if state.generation == permit.generation {
                if let Phase::HalfOpen { trial_in_flight } = &mut state.phase {
                    *trial_in_flight = false;
                }
            }
        }
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

/// Permission to make one call through a circuit.
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping a trial permit without
/// an outcome frees the trial slot for the next caller.
#[must_use = "report the call outcome on the permit"]
pub struct BreakerPermit<'a> {
    breakers: &'a CircuitBreakers,
    backend: String,
    generation: u64,
    kind: PermitKind,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    pub fn record_success(self) {
        self.record_at(true, Instant::now());
    }

    pub fn record_failure(self) {
        self.record_at(false, Instant::now());
    }

    pub fn record_at(mut self, success: bool, now: Instant) {
        self.breakers.settle(&self, success, now);
        self.settled = true;
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Trial {
            self.breakers.release_trial(self);
        }
    }
}
