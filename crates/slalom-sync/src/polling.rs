//! # Polling Manager
//!
//! Owns the single periodic "check the cloud" timer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Polling Loop                                    │
//! │                                                                         │
//! │   interval (watch) ───────┐                                             │
//! │                           ▼                                             │
//! │   ┌──────────┐  sleep  ┌──────┐  tick()  ┌────────────────┐            │
//! │   │  timer   │ ──────► │ fire │ ───────► │ SyncCoordinator│            │
//! │   │  task    │ ◄────── │      │          │  fetch + merge │            │
//! │   └──────────┘ changed └──────┘          └───────┬────────┘            │
//! │        ▲                                         │                      │
//! │        │ set_interval (no-op if unchanged)       │ adjust_polling_      │
//! │        │                                         │ interval(ok, changes)│
//! │   ┌────┴──────────────────────────────┐          │                      │
//! │   │ ladder index / idle ticks / errors │ ◄───────┘                      │
//! │   │ tier ← network, battery, visibility│ ◄─── monitor callbacks         │
//! │   └────────────────────────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The next sleep starts only after a tick's callback finished, so ticks
//! never overlap. Reprogramming the interval restarts the pending sleep.

use futures_util::future::BoxFuture;
use slalom_core::polling::{resolve_polling_tier, PollingConfig, PollingEnvironment, PollingTier};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PollingSettings;
use crate::guard::ReentrancyGuard;
use crate::monitor::{environment_snapshot, BatteryMonitor, NetworkMonitor, VisibilityMonitor};
use crate::signal::Subscription;

/// Invoked on every polling tick.
pub type TickCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct PollingState {
    tier: PollingTier,
    config: PollingConfig,
    ladder_index: usize,
    idle_ticks: u32,
    consecutive_errors: u32,
    /// Set when a fetch failed for lack of connectivity, cleared by the next
    /// success. Forces the offline tier even if the monitor still says online.
    link_down: bool,
    current: Duration,
    running: bool,
}

/// Adaptive polling timer.
pub struct PollingManager {
    network: Arc<dyn NetworkMonitor>,
    battery: Arc<dyn BatteryMonitor>,
    visibility: Arc<dyn VisibilityMonitor>,
    settings: PollingSettings,
    state: Mutex<PollingState>,
    guard: ReentrancyGuard,
    env_dirty: AtomicBool,
    interval_tx: watch::Sender<Option<Duration>>,
    callback: Mutex<Option<TickCallback>>,
    subscriptions: Mutex<Vec<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PollingManager {
    pub fn new(
        network: Arc<dyn NetworkMonitor>,
        battery: Arc<dyn BatteryMonitor>,
        visibility: Arc<dyn VisibilityMonitor>,
        settings: PollingSettings,
    ) -> Self {
        let env = environment_snapshot(network.as_ref(), battery.as_ref(), visibility.as_ref());
        let tier = resolve_polling_tier(&env);
        let config = tier.config();
        let (interval_tx, _) = watch::channel(None);

        PollingManager {
            network,
            battery,
            visibility,
            settings,
            state: Mutex::new(PollingState {
                tier,
                config,
                ladder_index: 0,
                idle_ticks: 0,
                consecutive_errors: 0,
                link_down: false,
                current: config.base_interval,
                running: false,
            }),
            guard: ReentrancyGuard::new(),
            env_dirty: AtomicBool::new(false),
            interval_tx,
            callback: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    /// Registers the tick callback and subscribes to environment signals.
    ///
    /// Calling it again replaces the callback and the subscriptions.
    pub fn initialize(self: &Arc<Self>, callback: TickCallback) {
        *lock(&self.callback) = Some(callback);

        let mut subscriptions = Vec::with_capacity(3);

        let weak = Arc::downgrade(self);
        subscriptions.push(self.network.on_quality_change(Box::new(move |_| {
            if let Some(manager) = weak.upgrade() {
                manager.on_environment_change();
            }
        })));

        let weak = Arc::downgrade(self);
        subscriptions.push(self.battery.subscribe(Box::new(move |_| {
            if let Some(manager) = weak.upgrade() {
                manager.on_environment_change();
            }
        })));

        let weak: Weak<Self> = Arc::downgrade(self);
        subscriptions.push(self.visibility.subscribe(Box::new(move |hidden| {
            if let Some(manager) = weak.upgrade() {
                manager.on_environment_change();
                if !hidden {
                    manager.refresh_now();
                }
            }
        })));

        *lock(&self.subscriptions) = subscriptions;
        self.on_environment_change();

        debug!(
            interval_ms = self.current_interval().as_millis() as u64,
            "Polling manager initialized"
        );
    }

    /// Starts the timer. A running timer is left untouched.
    pub fn start(&self) {
        let Some(callback) = lock(&self.callback).clone() else {
            warn!("Polling start requested before initialize");
            return;
        };

        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let interval = {
            let mut state = lock(&self.state);
            state.running = true;
            state.current
        };
        self.interval_tx.send_replace(Some(interval));

        let mut rx = self.interval_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                let Some(interval) = *rx.borrow_and_update() else {
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        callback().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        info!(interval_ms = interval.as_millis() as u64, "Polling started");
    }

    /// Stops the timer. Safe to call when not running.
    pub fn stop(&self) {
        lock(&self.state).running = false;
        self.interval_tx.send_replace(None);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            info!("Polling stopped");
        }
    }

    /// Stops the timer and drops the callback and signal subscriptions.
    pub fn shutdown(&self) {
        self.stop();
        lock(&self.subscriptions).clear();
        *lock(&self.callback) = None;
    }

    /// Feeds a fetch outcome back into the schedule.
    ///
    /// Errors count towards the error threshold. A success with changes
    /// snaps back to the tier's base interval; a run of `threshold` idle
    /// successes moves one step down the ladder.
    pub fn adjust_polling_interval(&self, success: bool, has_changes: bool) {
        {
            let Some(_token) = self.guard.try_acquire() else {
                debug!("Polling adjustment already in progress, skipping");
                return;
            };
            let mut state = lock(&self.state);

            if !success {
                state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                if state.consecutive_errors >= self.settings.error_threshold {
                    debug!(
                        consecutive_errors = state.consecutive_errors,
                        "Error threshold reached, slowing polling"
                    );
                }
                let target = self.effective_interval(&state);
                self.set_interval(&mut state, target);
            } else {
                state.consecutive_errors = 0;
                if state.link_down {
                    state.link_down = false;
                    self.apply_tier(&mut state);
                }

                if has_changes {
                    state.idle_ticks = 0;
                    state.ladder_index = 0;
                } else {
                    state.idle_ticks = state.idle_ticks.saturating_add(1);
                    if state.idle_ticks >= state.config.threshold {
                        state.idle_ticks = 0;
                        state.ladder_index = (state.ladder_index + 1).min(state.config.max_index());
                        debug!(ladder_index = state.ladder_index, "No remote changes, backing off");
                    }
                }
                let target = self.effective_interval(&state);
                self.set_interval(&mut state, target);
            }
            drop(state);
            self.apply_pending_environment();
        }

        self.drain_environment_changes();
    }

    /// Forces the offline tier after a fetch failed for lack of connectivity.
    pub fn report_connectivity_loss(&self) {
        let mut state = lock(&self.state);
        if !state.link_down {
            info!("Connectivity lost, switching to offline polling");
        }
        state.link_down = true;
        self.apply_tier(&mut state);
        let target = self.effective_interval(&state);
        self.set_interval(&mut state, target);
    }

    /// Returns to the fastest interval of the current tier immediately.
    pub fn reset_to_fast_polling(&self) {
        let mut state = lock(&self.state);
        state.ladder_index = 0;
        state.idle_ticks = 0;
        let target = self.effective_interval(&state);
        self.set_interval(&mut state, target);
    }

    /// Re-resolves the tier from the monitors and reprograms the timer.
    ///
    /// If an adjustment holds the guard, the change is picked up when it
    /// releases.
    pub fn on_environment_change(&self) {
        self.env_dirty.store(true, Ordering::SeqCst);
        let Some(_token) = self.guard.try_acquire() else {
            return;
        };
        self.apply_pending_environment();
    }

    /// Runs the tick callback now, outside the timer.
    pub fn refresh_now(&self) {
        let Some(callback) = lock(&self.callback).clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(callback());
            }
            Err(_) => warn!("No async runtime available for an immediate refresh"),
        }
    }

    /// Resolves the configuration for the current environment.
    pub fn polling_config(&self) -> PollingConfig {
        let state = lock(&self.state);
        self.resolve_tier(&state).config()
    }

    pub fn tier(&self) -> PollingTier {
        lock(&self.state).tier
    }

    /// Interval the timer is (or will be) programmed with.
    pub fn current_interval(&self) -> Duration {
        lock(&self.state).current
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn consecutive_errors(&self) -> u32 {
        lock(&self.state).consecutive_errors
    }

    pub fn ladder_index(&self) -> usize {
        lock(&self.state).ladder_index
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn environment(&self) -> PollingEnvironment {
        environment_snapshot(self.network.as_ref(), self.battery.as_ref(), self.visibility.as_ref())
    }

    fn resolve_tier(&self, state: &PollingState) -> PollingTier {
        if state.link_down {
            PollingTier::Offline
        } else {
            resolve_polling_tier(&self.environment())
        }
    }

    /// Switches tier if the environment moved; a new tier starts at the
    /// bottom of its ladder.
    fn apply_tier(&self, state: &mut PollingState) {
        let tier = self.resolve_tier(state);
        if tier != state.tier {
            info!(from = ?state.tier, to = ?tier, "Polling tier changed");
            state.tier = tier;
            state.config = tier.config();
            state.ladder_index = 0;
            state.idle_ticks = 0;
        }
    }

    fn apply_pending_environment(&self) {
        while self.env_dirty.swap(false, Ordering::SeqCst) {
            let mut state = lock(&self.state);
            self.apply_tier(&mut state);
            let target = self.effective_interval(&state);
            self.set_interval(&mut state, target);
        }
    }

    fn drain_environment_changes(&self) {
        if self.env_dirty.load(Ordering::SeqCst) {
            if let Some(_token) = self.guard.try_acquire() {
                self.apply_pending_environment();
            }
        }
    }

    fn effective_interval(&self, state: &PollingState) -> Duration {
        let ladder = state.config.interval_at(state.ladder_index);
        if state.consecutive_errors >= self.settings.error_threshold {
            ladder.max(self.settings.error_interval())
        } else {
            ladder
        }
    }

    /// The only place the timer is reprogrammed. No-op if unchanged.
    fn set_interval(&self, state: &mut PollingState, interval: Duration) {
        if state.current == interval {
            return;
        }
        debug!(
            from_ms = state.current.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Polling interval changed"
        );
        state.current = interval;
        if state.running {
            self.interval_tx.send_replace(Some(interval));
        }
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
