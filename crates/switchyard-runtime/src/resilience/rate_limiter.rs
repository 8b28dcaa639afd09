//! Token bucket admission control, one bucket per caller key.
//!
//! Buckets refill lazily on access: `tokens = min(capacity, tokens +
//! elapsed * refill_rate)`. Tokens are fractional so slow refill rates
//! accumulate correctly between calls.
//!
//! The bucket map is bounded: once it holds `max_tracked` callers, a new
//! caller first triggers a sweep of buckets that have refilled completely.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use switchyard_core::RateLimitSettings;

/// Tracked callers above which new callers trigger an idle sweep.
pub const DEFAULT_MAX_TRACKED_CALLERS: usize = 10_000;

/// A caller ran out of tokens.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    /// Time until one whole token is available
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * refill_rate).min(capacity);
        self.last_refill = now;
    }
}

/// Per-caller rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    capacity: f64,
    refill_rate: f64,
    max_tracked: usize,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: f64::from(settings.capacity),
            refill_rate: settings.refill_rate,
            max_tracked: DEFAULT_MAX_TRACKED_CALLERS,
        }
    }

    /// Change the caller count that triggers an idle sweep.
    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    /// Time for an empty bucket to refill completely.
    fn refill_time(&self) -> Duration {
        seconds(self.capacity / self.refill_rate)
    }

    /// Take one token for `caller`, or report how long to wait.
    ///
    /// Never blocks.
    pub fn try_acquire(&self, caller: &str) -> Result<(), RateLimitExceeded> {
        self.try_acquire_at(caller, Instant::now())
    }

    pub fn try_acquire_at(&self, caller: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut buckets = self.buckets.lock();
        if buckets.len() >= self.max_tracked && !buckets.contains_key(caller) {
            let refill_time = self.refill_time();
            retain_active(&mut buckets, refill_time, now);
        }

        let bucket = buckets
            .entry(caller.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity, now));

        bucket.refill(self.capacity, self.refill_rate, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after = seconds((1.0 - bucket.tokens) / self.refill_rate);
            tracing::debug!(
                caller = %caller,
                retry_after = ?retry_after,
                "Rate limit exceeded"
            );
            Err(RateLimitExceeded { retry_after })
        }
    }

    /// Tokens currently available to `caller`, after refill.
    pub fn available(&self, caller: &str) -> f64 {
        self.available_at(caller, Instant::now())
    }

    pub fn available_at(&self, caller: &str, now: Instant) -> f64 {
        let buckets = self.buckets.lock();
        match buckets.get(caller) {
            Some(bucket) => {
                let mut bucket = bucket.clone();
                bucket.refill(self.capacity, self.refill_rate, now);
                bucket.tokens
            }
            None => self.capacity,
        }
    }

    /// Drop buckets untouched for at least `idle_for`.
    ///
    /// A pruned caller starts again with a full bucket, so only buckets that
    /// would have refilled completely are removed.
    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        self.prune_idle_at(idle_for, Instant::now())
    }

    pub fn prune_idle_at(&self, idle_for: Duration, now: Instant) -> usize {
        let idle_for = idle_for.max(self.refill_time());
        retain_active(&mut self.buckets.lock(), idle_for, now)
    }

    /// Number of tracked callers.
    pub fn tracked_callers(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Drop buckets untouched for at least `idle_for`, returning how many.
fn retain_active(
    buckets: &mut HashMap<String, TokenBucket>,
    idle_for: Duration,
    now: Instant,
) -> usize {
    let before = buckets.len();
    buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_for);
    let pruned = before - buckets.len();
    if pruned > 0 {
        tracing::debug!(pruned, remaining = buckets.len(), "Pruned idle rate limit buckets");
    }
    pruned
}

/// Float seconds to a `Duration`, saturating on overflow.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitSettings::default())
    }
}
