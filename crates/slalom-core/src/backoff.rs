//! Retry backoff for queued sends.
//!
//! `delay = base * 2^retry * (0.5 + jitter)`, capped at `max_delay`, where
//! `jitter` is drawn from `[0, 1)` by the caller.

use std::time::Duration;

/// Maximum send attempts before a queue item is evicted.
pub const MAX_RETRIES: u32 = 5;

/// Backoff parameters for the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(300_000),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` may be attempted.
    pub fn delay_with_jitter(&self, retry_count: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        let factor = 2u64.saturating_pow(retry_count.min(63)) as f64;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * factor * (0.5 + jitter)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Smallest delay the jitter can produce for `retry_count`.
    pub fn min_delay(&self, retry_count: u32) -> Duration {
        self.delay_with_jitter(retry_count, 0.0)
    }

    /// Returns true once an item may no longer be sent.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
