//! # Race-Scoped Operations
//!
//! Every network call runs inside a [`RaceScope`]. It gets a deadline and a
//! cancellation signal. The caller gets back the [`RaceContext`] it started
//! under, so late results from a previous race are discarded instead of
//! applied.
//!
//! ```text
//! begin("race-a") ─► ctx{race-a, gen 1}
//!                        │ run(ctx, fut)
//!                        │    ├─ fut resolves in time ─► still gen 1? ─► Ok
//!                        │    │                                  └─ no ─► RaceChanged
//!                        │    ├─ deadline elapses ─────────────────────► Timeout
//! begin("race-b") ───────┴────┴─ epoch bumped ─────────────────────────► Cancelled
//! ```

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{SyncError, SyncResult};

/// The race an operation was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceContext {
    pub race_id: String,
    pub generation: u64,
}

#[derive(Default)]
struct ScopeState {
    current: Option<RaceContext>,
    generation: u64,
}

/// Tracks the active race and cancels operations started under an older one.
pub struct RaceScope {
    state: Mutex<ScopeState>,
    epoch: watch::Sender<u64>,
    timeout: Duration,
}

fn lock(mutex: &Mutex<ScopeState>) -> MutexGuard<'_, ScopeState> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RaceScope {
    pub fn new(timeout: Duration) -> Self {
        let (epoch, _) = watch::channel(0);
        RaceScope {
            state: Mutex::new(ScopeState::default()),
            epoch,
            timeout,
        }
    }

    /// Makes `race_id` the active race. In-flight operations are cancelled.
    pub fn begin(&self, race_id: &str) -> RaceContext {
        let ctx = {
            let mut state = lock(&self.state);
            state.generation += 1;
            let ctx = RaceContext {
                race_id: race_id.to_string(),
                generation: state.generation,
            };
            state.current = Some(ctx.clone());
            ctx
        };
        self.cancel_all();
        ctx
    }

    /// Clears the active race. In-flight operations are cancelled.
    pub fn end(&self) -> Option<RaceContext> {
        let previous = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.current.take()
        };
        self.cancel_all();
        previous
    }

    pub fn current(&self) -> Option<RaceContext> {
        lock(&self.state).current.clone()
    }

    /// Returns the active context or `NotInitialized`.
    pub fn require(&self) -> SyncResult<RaceContext> {
        self.current().ok_or(SyncError::NotInitialized)
    }

    pub fn is_current(&self, ctx: &RaceContext) -> bool {
        lock(&self.state).current.as_ref() == Some(ctx)
    }

    /// Fails with `RaceChanged` unless `ctx` is still the active context.
    pub fn ensure_current(&self, ctx: &RaceContext) -> SyncResult<()> {
        if self.is_current(ctx) {
            Ok(())
        } else {
            Err(SyncError::RaceChanged)
        }
    }

    /// Aborts every operation currently inside [`run`](Self::run).
    pub fn cancel_all(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `fut` under `ctx` with the scope's deadline.
    ///
    /// A cancelled or timed-out operation is dropped before it completes.
    /// A result that arrives after the race changed becomes `RaceChanged`.
    pub async fn run<T, F>(&self, ctx: &RaceContext, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        self.ensure_current(ctx)?;
        let mut epoch = self.epoch.subscribe();
        epoch.borrow_and_update();

        let result = tokio::select! {
            biased;
            _ = cancelled(&mut epoch) => Err(SyncError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.timeout.as_millis() as u64)),
            },
        };

        // A result for an old race is never returned as a success.
        match result {
            Ok(value) => {
                self.ensure_current(ctx)?;
                Ok(value)
            }
            Err(err) if !self.is_current(ctx) && !matches!(err, SyncError::Cancelled) => {
                Err(SyncError::RaceChanged)
            }
            Err(err) => Err(err),
        }
    }
}

async fn cancelled(epoch: &mut watch::Receiver<u64>) {
    if epoch.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
