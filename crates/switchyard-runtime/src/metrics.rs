//! Prometheus metrics for dispatched tasks and backend calls.
//!
//! Every metric lives in a registry owned by [`DispatchMetrics`], so several
//! orchestrators in one process never collide. Export it in text format
//! with [`DispatchMetrics::export`].
//!
//! | metric | labels |
//! |---|---|
//! | `switchyard_backend_calls_total` | `backend`, `result` (`ok` / `error`) |
//! | `switchyard_backend_call_errors_total` | `backend`, `code` |
//! | `switchyard_backend_call_duration_seconds` | `backend` |
//! | `switchyard_tokens_total` | `backend`, `direction` (`prompt` / `completion`) |
//! | `switchyard_task_errors_total` | `code` |
//! | `switchyard_active_tasks` | |

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::time::Duration;

use crate::backends::BackendResponse;
use crate::resilience::InvocationError;

const LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Aggregated counters for one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,

    /// Mean latency of all calls, successful or not
    pub mean_latency: Duration,
}

/// Metrics collector shared by the orchestrator.
pub struct DispatchMetrics {
    registry: Registry,
    calls: IntCounterVec,
    call_errors: IntCounterVec,
    call_duration: HistogramVec,
    tokens: IntCounterVec,
    task_errors: IntCounterVec,
    active_tasks: IntGauge,
}

impl DispatchMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let calls = IntCounterVec::new(
            Opts::new("switchyard_backend_calls_total", "Backend calls by result"),
            &["backend", "result"],
        )?;
        let call_errors = IntCounterVec::new(
            Opts::new(
                "switchyard_backend_call_errors_total",
                "Failed backend calls by error code",
            ),
            &["backend", "code"],
        )?;
        let call_duration = HistogramVec::new(
            HistogramOpts::new(
                "switchyard_backend_call_duration_seconds",
                "Backend call latency including retries",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["backend"],
        )?;
        let tokens = IntCounterVec::new(
            Opts::new("switchyard_tokens_total", "Tokens reported by backends"),
            &["backend", "direction"],
        )?;
        let task_errors = IntCounterVec::new(
            Opts::new("switchyard_task_errors_total", "Failed tasks by error code"),
            &["code"],
        )?;
        let active_tasks = IntGauge::new("switchyard_active_tasks", "Tasks being handled")?;

        registry.register(Box::new(calls.clone()))?;
        registry.register(Box::new(call_errors.clone()))?;
        registry.register(Box::new(call_duration.clone()))?;
        registry.register(Box::new(tokens.clone()))?;
        registry.register(Box::new(task_errors.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;

        Ok(Self {
            registry,
            calls,
            call_errors,
            call_duration,
            tokens,
            task_errors,
            active_tasks,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one logical backend call, retries included.
    pub fn record_call(
        &self,
        backend: &str,
        elapsed: Duration,
        outcome: &Result<BackendResponse, InvocationError>,
    ) {
        self.call_duration
            .with_label_values(&[backend])
            .observe(elapsed.as_secs_f64());

        match outcome {
            Ok(response) => {
                self.calls.with_label_values(&[backend, "ok"]).inc();
                self.tokens
                    .with_label_values(&[backend, "prompt"])
                    .inc_by(u64::from(response.usage.prompt_tokens));
                self.tokens
                    .with_label_values(&[backend, "completion"])
                    .inc_by(u64::from(response.usage.completion_tokens));
            }
            Err(e) => {
                self.calls.with_label_values(&[backend, "error"]).inc();
                self.call_errors
                    .with_label_values(&[backend, e.code()])
                    .inc();
            }
        }
    }

    /// Record a task that failed with `code`.
    pub fn record_task_error(&self, code: &str) {
        self.task_errors.with_label_values(&[code]).inc();
    }

    /// Count a task as active until the guard is dropped.
    pub fn track_active(&self) -> ActiveTask<'_> {
        self.active_tasks.inc();
        ActiveTask {
            gauge: &self.active_tasks,
        }
    }

    pub fn active_tasks(&self) -> i64 {
        self.active_tasks.get()
    }

    pub fn task_errors(&self, code: &str) -> u64 {
        self.task_errors.with_label_values(&[code]).get()
    }

    pub fn call_errors(&self, backend: &str, code: &str) -> u64 {
        self.call_errors.with_label_values(&[backend, code]).get()
    }

    pub fn stats(&self, backend: &str) -> BackendStats {
        let successes = self.calls.with_label_values(&[backend, "ok"]).get();
        let failures = self.calls.with_label_values(&[backend, "error"]).get();
        let latency = self.call_duration.with_label_values(&[backend]);
        let samples = latency.get_sample_count();
        let mean_latency = if samples == 0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(latency.get_sample_sum() / samples as f64)
                .unwrap_or_default()
        };

        BackendStats {
            calls: successes + failures,
            successes,
            failures,
            prompt_tokens: self.tokens.with_label_values(&[backend, "prompt"]).get(),
            completion_tokens: self.tokens.with_label_values(&[backend, "completion"]).get(),
            mean_latency,
        }
    }

    /// Prometheus text exposition of every metric.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for DispatchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchMetrics")
            .field("active_tasks", &self.active_tasks.get())
            .finish()
    }
}

/// Guard returned by [`DispatchMetrics::track_active`].
#[must_use]
pub struct ActiveTask<'a> {
    gauge: &'a IntGauge,
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
