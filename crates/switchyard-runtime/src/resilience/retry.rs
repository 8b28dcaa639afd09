//! Retry schedule with exponential backoff and jitter.

use backon::{BackoffBuilder, ExponentialBuilder};
use rand::Rng;
use std::time::Duration;

use switchyard_core::RetrySettings;

/// Bounded retry policy.
///
/// The base delay before retry `n` is `min(max_delay, base_delay * 2^n)`;
/// each delay is then scaled by a uniform factor in `[0.5, 1.5)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }

    /// Overall budget for one logical call.
    pub fn deadline(&self) -> Duration {
        self.settings.deadline
    }

    /// Un-jittered delays between attempts, one per retry.
    pub fn base_delays(&self) -> impl Iterator<Item = Duration> {
        let retries = self.settings.max_attempts.saturating_sub(1) as usize;
        ExponentialBuilder::default()
            .with_min_delay(self.settings.base_delay)
            .with_max_delay(self.settings.max_delay)
            .with_factor(2.0)
            .with_max_times(retries)
            .build()
    }

    /// Jittered delays between attempts, one per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        self.base_delays().map(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    delay.mul_f64(factor)
}
