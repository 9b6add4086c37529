//! Non-blocking re-entrancy guard.
//!
//! Replaces "in progress" boolean flags. A second caller that finds the guard
//! held gets `None` and must treat its call as a no-op; it never waits.
//!
//! The flag is an atomic so the guard is sound on tokio's multi-threaded
//! runtime. It is still a try-lock only: it gives mutual exclusion of a
//! critical section, not ordering between callers. State guarded by it lives
//! behind its own `Mutex`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct ReentrancyGuard {
    busy: Arc<AtomicBool>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the guard if it is free. Released when the token drops.
    pub fn try_acquire(&self) -> Option<GuardToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// RAII token of a held [`ReentrancyGuard`].
#[derive(Debug)]
pub struct GuardToken {
    busy: Arc<AtomicBool>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
