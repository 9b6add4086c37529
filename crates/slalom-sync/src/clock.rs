//! Injected wall clock and jitter source.
//!
//! Timers run on tokio time (pausable in tests). Epoch timestamps stored in
//! queue items and `syncedAt` come from a [`Clock`] so they can be controlled
//! independently.

use slalom_core::EpochMillis;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Source of epoch-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> EpochMillis;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EpochMillis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        ManualClock {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: EpochMillis) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Source of backoff jitter in `[0, 1)`.
pub trait Jitter: Send + Sync {
    fn sample(&self) -> f64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always returns the same value.
#[derive(Debug)]
pub struct FixedJitter(Mutex<f64>);

impl FixedJitter {
    pub fn new(value: f64) -> Self {
        FixedJitter(Mutex::new(value))
    }

    pub fn set(&self, value: f64) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = value;
        }
    }
}

impl Jitter for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.lock().map(|v| *v).unwrap_or(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_random_jitter_range() {
        for _ in 0..100 {
            let j = RandomJitter.sample();
            assert!((0.0..1.0).contains(&j));
        }
    }
}
