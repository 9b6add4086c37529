//! # Queue Processor
//!
//! Owns the single periodic "drain pending sends" timer and the persisted
//! queue of records the cloud has not acknowledged yet.
//!
//! ## Drain Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  process_queue()                                                        │
//! │                                                                         │
//! │  1. try_acquire(draining) ── held? ──► no-op                            │
//! │  2. evict items with retryCount >= max          (warn!, silent loss)    │
//! │  3. skip items still inside their backoff window                        │
//! │     delay = base * 2^retryCount * (0.5 + jitter)                        │
//! │  4. take up to batch_size eligible items                                │
//! │  5. ≥ 2 items and a batch sender? ── yes ──► one batch request          │
//! │                                   └─ no ───► send one by one            │
//! │  6. race context changed while awaiting? ──► discard results            │
//! │  7. sent → remove                                                        │
//! │     failed → retryCount+1, lastAttempt=now, error; evict at max         │
//! │     offline → untouched (retried on reconnect, not counted)             │
//! │  8. persist                                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use futures_util::future::BoxFuture;
use slalom_core::{QueueStore, RecordKey, RetryPolicy, SyncQueueItem, SyncRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Jitter};
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::guard::ReentrancyGuard;

/// Sends a single record queued under the given race.
pub type SendOne<T> = Arc<dyn Fn(String, T) -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;

/// Sends several records queued under the given race in one request.
/// Returns success per record id; ids missing from the map count as failed.
pub type SendMany<T> =
    Arc<
        dyn Fn(String, Vec<T>) -> BoxFuture<'static, SyncResult<HashMap<String, bool>>>
            + Send
            + Sync,
    >;

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    pub evicted: usize,
    /// Another drain was already running.
    pub skipped: bool,
    /// The race context changed while sending; nothing was applied.
    pub discarded: bool,
}

enum SendOutcome {
    Sent,
    Failed(String),
    Deferred,
    Untouched,
}

impl SendOutcome {
    fn from_error(err: &SyncError) -> Self {
        if err.is_connectivity() {
            SendOutcome::Deferred
        } else if err.counts_against_retries() {
            SendOutcome::Failed(err.to_string())
        } else {
            SendOutcome::Untouched
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Retry queue for one record family.
pub struct QueueProcessor<T: SyncRecord> {
    items: Mutex<Vec<SyncQueueItem<T>>>,
    policy: RetryPolicy,
    batch_size: usize,
    drain_interval: Duration,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    storage: Option<Arc<dyn QueueStore<T>>>,
    race_id: Mutex<Option<String>>,
    generation: AtomicU64,
    send_one: Mutex<Option<SendOne<T>>>,
    send_many: Mutex<Option<SendMany<T>>>,
    draining: ReentrancyGuard,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SyncRecord> QueueProcessor<T> {
    pub fn new(
        policy: RetryPolicy,
        batch_size: usize,
        drain_interval: Duration,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
        storage: Option<Arc<dyn QueueStore<T>>>,
    ) -> Self {
        QueueProcessor {
            items: Mutex::new(Vec::new()),
            policy,
            batch_size: batch_size.max(1),
            drain_interval,
            clock,
            jitter,
            storage,
            race_id: Mutex::new(None),
            generation: AtomicU64::new(0),
            send_one: Mutex::new(None),
            send_many: Mutex::new(None),
            draining: ReentrancyGuard::new(),
            task: Mutex::new(None),
        }
    }

    /// Registers the single-record sender.
    pub fn initialize(&self, send_one: SendOne<T>) {
        *lock(&self.send_one) = Some(send_one);
    }

    /// Registers the batch sender.
    pub fn initialize_batch(&self, send_many: SendMany<T>) {
        *lock(&self.send_many) = Some(send_many);
    }

    /// Binds the queue to a race and loads its persisted items.
    pub async fn attach(&self, race_id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let loaded = match &self.storage {
            Some(storage) => match storage.load_queue(race_id).await {
                Ok(items) => items,
                Err(e) => {
                    error!(
                        kind = %T::KIND,
                        race_id = %race_id,
                        error = %e,
                        "Failed to load send queue"
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        info!(kind = %T::KIND, race_id = %race_id, items = loaded.len(), "Send queue attached");
        *lock(&self.items) = loaded;
        *lock(&self.race_id) = Some(race_id.to_string());
    }

    /// Persists and unbinds the queue. In-flight drains are discarded.
    pub async fn detach(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let race_id = lock(&self.race_id).take();
        let items = std::mem::take(&mut *lock(&self.items));
        if let Some(race_id) = race_id {
            self.persist(&race_id, &items).await;
            debug!(kind = %T::KIND, race_id = %race_id, "Send queue detached");
        }
    }

    /// Queues a record. Returns false if its key is already queued or no
    /// race is attached.
    pub async fn enqueue(&self, entry: T, error: Option<String>) -> bool {
        let Some(race_id) = self.race_id() else {
            warn!(kind = %T::KIND, id = %entry.id(), "Cannot queue record without an active race");
            return false;
        };

        let snapshot = {
            let mut items = lock(&self.items);
            let key = entry.key();
            if items.iter().any(|item| item.key() == key) {
                return false;
            }
            let mut item = SyncQueueItem::new(entry, self.clock.now_ms());
            item.error = error;
            debug!(kind = %T::KIND, key = %key, "Queued for sync");
            items.push(item);
            items.clone()
        };

        self.persist(&race_id, &snapshot).await;
        true
    }

    /// Runs one drain pass. A call made while another drain runs is a no-op.
    pub async fn process_queue(&self) -> DrainReport {
        let Some(_token) = self.draining.try_acquire() else {
            debug!(kind = %T::KIND, "Drain already running, skipping");
            return DrainReport {
                skipped: true,
                ..DrainReport::default()
            };
        };

        let mut report = DrainReport::default();
        let Some(race_id) = self.race_id() else {
            return report;
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let now = self.clock.now_ms();

        let (eligible, evicted_snapshot) = {
            let mut items = lock(&self.items);
            let before = items.len();
            items.retain(|item| {
                let keep = !self.policy.is_exhausted(item.retry_count);
                if !keep {
                    warn!(
                        kind = %T::KIND,
                        key = %item.key(),
                        retry_count = item.retry_count,
                        error = item.error.as_deref().unwrap_or(""),
                        "Dropping record after max retries"
                    );
                }
                keep
            });
            report.evicted = before - items.len();

            let eligible: Vec<T> = items
                .iter()
                .filter(|item| {
                    let delay = self.policy.delay_with_jitter(
                        item.retry_count,
                        self.jitter.sample(),
                    );
                    now.saturating_sub(item.last_attempt) >= delay.as_millis() as i64
                })
                .take(self.batch_size)
                .map(|item| item.entry.clone())
                .collect();

            (eligible, (report.evicted > 0).then(|| items.clone()))
        };

        if let Some(snapshot) = evicted_snapshot {
            self.persist(&race_id, &snapshot).await;
        }
        if eligible.is_empty() {
            return report;
        }

        let send_one = lock(&self.send_one).clone();
        let send_many = lock(&self.send_many).clone();

        let outcomes = match (send_many, send_one) {
            (Some(send_many), _) if eligible.len() >= 2 => {
                Self::send_batch(&send_many, &race_id, eligible).await
            }
            (_, Some(send_one)) => Self::send_each(&send_one, &race_id, eligible).await,
            (Some(send_many), None) => Self::send_batch(&send_many, &race_id, eligible).await,
            (None, None) => {
                warn!(kind = %T::KIND, "Queue has items but no sender is configured");
                return report;
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            info!(
                kind = %T::KIND,
                race_id = %race_id,
                "Race changed during drain, discarding results"
            );
            report.discarded = true;
            return report;
        }

        let finished = self.clock.now_ms();
        let snapshot = {
            let mut items = lock(&self.items);
            for (key, outcome) in outcomes {
                let Some(pos) = items.iter().position(|item| item.key() == key) else {
                    continue;
                };
                match outcome {
                    SendOutcome::Sent => {
                        items.remove(pos);
                        report.sent += 1;
                    }
                    SendOutcome::Failed(reason) => {
                        report.failed += 1;
                        items[pos].record_failure(finished, reason);
                        let retry_count = items[pos].retry_count;
                        if self.policy.is_exhausted(retry_count) {
                            warn!(
                                kind = %T::KIND,
                                key = %key,
                                retry_count,
                                "Dropping record after max retries"
                            );
                            items.remove(pos);
                            report.evicted += 1;
                        } else {
                            debug!(
                                kind = %T::KIND,
                                key = %key,
                                retry_count,
                                "Send failed, will retry"
                            );
                        }
                    }
                    SendOutcome::Deferred => report.deferred += 1,
                    SendOutcome::Untouched => {}
                }
            }
            items.clone()
        };

        self.persist(&race_id, &snapshot).await;

        if report.sent + report.failed + report.evicted > 0 {
            info!(
                kind = %T::KIND,
                sent = report.sent,
                failed = report.failed,
                deferred = report.deferred,
                evicted = report.evicted,
                remaining = snapshot.len(),
                "Drain pass complete"
            );
        }
        report
    }

    async fn send_batch(
        send_many: &SendMany<T>,
        race_id: &str,
        eligible: Vec<T>,
    ) -> Vec<(RecordKey, SendOutcome)> {
        let keys: Vec<(RecordKey, String)> =
            eligible.iter().map(|e| (e.key(), e.id().to_string())).collect();
        match send_many(race_id.to_string(), eligible).await {
            Ok(results) => keys
                .into_iter()
                .map(|(key, id)| {
                    let outcome = if results.get(&id).copied().unwrap_or(false) {
                        SendOutcome::Sent
                    } else {
                        SendOutcome::Failed("not acknowledged in batch response".to_string())
                    };
                    (key, outcome)
                })
                .collect(),
            Err(err) => {
                debug!(error = %err, "Batch send failed");
                keys.into_iter()
                    .map(|(key, _)| (key, SendOutcome::from_error(&err)))
                    .collect()
            }
        }
    }

    /// Sends sequentially. Stops at the first failure that would hit every
    /// remaining item the same way (offline, race changed, auth expired).
    async fn send_each(
        send_one: &SendOne<T>,
        race_id: &str,
        eligible: Vec<T>,
    ) -> Vec<(RecordKey, SendOutcome)> {
        let mut outcomes = Vec::with_capacity(eligible.len());
        for entry in eligible {
            let key = entry.key();
            match send_one(race_id.to_string(), entry).await {
                Ok(()) => outcomes.push((key, SendOutcome::Sent)),
                Err(err) => {
                    let stop = matches!(
                        err.class(),
                        ErrorClass::Connectivity | ErrorClass::RaceChanged | ErrorClass::AuthExpired
                    );
                    outcomes.push((key, SendOutcome::from_error(&err)));
                    if stop {
                        break;
                    }
                }
            }
        }
        outcomes
    }

    /// Starts the periodic drain timer. A running timer is left untouched.
    pub fn start(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.drain_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(processor) = weak.upgrade() else {
                    break;
                };
                processor.process_queue().await;
            }
        }));
        debug!(kind = %T::KIND, interval_secs = period.as_secs(), "Queue drain timer started");
    }

    pub fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            debug!(kind = %T::KIND, "Queue drain timer stopped");
        }
    }

    pub fn queue_length(&self) -> usize {
        lock(&self.items).len()
    }

    /// Snapshot of the queued items.
    pub fn items(&self) -> Vec<SyncQueueItem<T>> {
        lock(&self.items).clone()
    }

    pub fn race_id(&self) -> Option<String> {
        lock(&self.race_id).clone()
    }

    async fn persist(&self, race_id: &str, items: &[SyncQueueItem<T>]) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_queue(race_id, items).await {
                error!(
                    kind = %T::KIND,
                    race_id = %race_id,
                    error = %e,
                    "Failed to persist send queue"
                );
            }
        }
    }
}

impl<T: SyncRecord> Drop for QueueProcessor<T> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedJitter, ManualClock};
    use crate::memory::MemoryStore;
    use crate::test_support::entry;
    use slalom_core::Entry;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Rig {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        queue: Arc<QueueProcessor<Entry>>,
    }

    async fn rig() -> Rig {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueProcessor::new(
            RetryPolicy::default(),
            10,
            Duration::from_secs(30),
            clock.clone(),
            Arc::new(FixedJitter::new(0.5)),
            Some(store.clone() as Arc<dyn QueueStore<Entry>>),
        ));
        queue.attach("race-1").await;
        Rig { clock, store, queue }
    }

    fn counting_sender(result: fn() -> SyncResult<()>, calls: Arc<AtomicUsize>) -> SendOne<Entry> {
        Arc::new(move |_race_id, _entry| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { result() })
        })
    }

    fn server_error() -> SyncResult<()> {
        Err(SyncError::Server {
            status: 503,
            message: "unavailable".into(),
        })
    }

    #[tokio::test]
    async fn test_successful_send_removes_item() {
        let rig = rig().await;
        let calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(|| Ok(()), calls.clone()));

        assert!(rig.queue.enqueue(entry("e1", "dev-a"), None).await);
        assert!(!rig.queue.enqueue(entry("e1", "dev-a"), None).await);
        assert_eq!(rig.queue.queue_length(), 1);

        rig.clock.set(1_000);
        let report = rig.queue.process_queue().await;
        assert_eq!(report.sent, 1);
        assert_eq!(rig.queue.queue_length(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(QueueStore::<Entry>::load_queue(&*rig.store, "race-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_window_skips_items() {
        let rig = rig().await;
        let calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(|| Ok(()), calls.clone()));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;

        rig.clock.set(999);
        let report = rig.queue.process_queue().await;
        assert_eq!(report.sent, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_item_evicted_on_fifth_failure() {
        let rig = rig().await;
        let calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(server_error, calls.clone()));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;

        // With jitter 0.5 the window after n failures is 1000 * 2^n ms.
        for at in [1_000, 3_000, 7_000] {
            rig.clock.set(at);
            rig.queue.process_queue().await;
        }
        let items = rig.queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 3);
        assert_eq!(items[0].last_attempt, 7_000);
        assert!(items[0].error.as_deref().unwrap_or("").contains("503"));

        rig.clock.set(15_000);
        rig.queue.process_queue().await;
        assert_eq!(rig.queue.items()[0].retry_count, 4);

        rig.clock.set(31_000);
        let report = rig.queue.process_queue().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(rig.queue.queue_length(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        rig.clock.set(1_000_000);
        rig.queue.process_queue().await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(QueueStore::<Entry>::load_queue(&*rig.store, "race-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_three_eligible_items_use_one_batch() {
        let rig = rig().await;
        let single_calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(|| Ok(()), single_calls.clone()));

        let batch_calls = Arc::new(AtomicUsize::new(0));
        let batch_sizes = Arc::new(Mutex::new(Vec::new()));
        let (bc, bs) = (batch_calls.clone(), batch_sizes.clone());
        rig.queue.initialize_batch(Arc::new(move |_race_id: String, entries: Vec<Entry>| {
            bc.fetch_add(1, Ordering::SeqCst);
            bs.lock().unwrap().push(entries.len());
            let results: HashMap<String, bool> =
                entries.iter().map(|e| (e.id.clone(), e.id != "e3")).collect();
            Box::pin(async move { Ok(results) })
        }));

        for id in ["e1", "e2", "e3"] {
            rig.queue.enqueue(entry(id, "dev-a"), None).await;
        }
        rig.clock.set(1_000);
        let report = rig.queue.process_queue().await;

        assert_eq!(batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*batch_sizes.lock().unwrap(), vec![3]);
        assert_eq!(single_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);

        let items = rig.queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].entry.id, "e3");
        assert_eq!(items[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_missing_ids_in_batch_result_count_as_failed() {
        let rig = rig().await;
        rig.queue.initialize_batch(Arc::new(|_race_id: String, _entries: Vec<Entry>| {
            Box::pin(async { Ok(HashMap::from([("e1".to_string(), true)])) })
        }));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;
        rig.queue.enqueue(entry("e2", "dev-a"), None).await;

        rig.clock.set(1_000);
        let report = rig.queue.process_queue().await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(rig.queue.items()[0].entry.id, "e2");
    }

    #[tokio::test]
    async fn test_connectivity_failure_defers_without_counting() {
        let rig = rig().await;
        let calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(
            || Err(SyncError::ConnectionFailed("unreachable".into())),
            calls.clone(),
        ));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;
        rig.queue.enqueue(entry("e2", "dev-a"), None).await;

        rig.clock.set(1_000);
        let report = rig.queue.process_queue().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rig.queue.items().iter().all(|i| i.retry_count == 0 && i.last_attempt == 0));
    }

    #[tokio::test]
    async fn test_persisted_exhausted_items_are_evicted() {
        let rig = rig().await;
        let mut stale = SyncQueueItem::new(entry("old", "dev-a"), 0);
        for _ in 0..5 {
            stale.record_failure(0, "HTTP 500");
        }
        QueueStore::<Entry>::save_queue(&*rig.store, "race-2", &[stale]).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(|| Ok(()), calls.clone()));
        rig.queue.attach("race-2").await;
        assert_eq!(rig.queue.queue_length(), 1);

        rig.clock.set(1_000_000);
        let report = rig.queue.process_queue().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_noop() {
        let rig = rig().await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (en, rel) = (entered.clone(), release.clone());
        rig.queue.initialize(Arc::new(move |_race_id, _entry| {
            let (en, rel) = (en.clone(), rel.clone());
            Box::pin(async move {
                en.notify_one();
                rel.notified().await;
                Ok(())
            })
        }));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;
        rig.clock.set(1_000);

        let queue = rig.queue.clone();
        let first = tokio::spawn(async move { queue.process_queue().await });
        entered.notified().await;

        let second = rig.queue.process_queue().await;
        assert!(second.skipped);

        release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.sent, 1);
    }

    #[tokio::test]
    async fn test_race_switch_discards_in_flight_results() {
        let rig = rig().await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (en, rel) = (entered.clone(), release.clone());
        rig.queue.initialize(Arc::new(move |_race_id, _entry| {
            let (en, rel) = (en.clone(), rel.clone());
            Box::pin(async move {
                en.notify_one();
                rel.notified().await;
                Ok(())
            })
        }));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;
        rig.clock.set(1_000);

        let queue = rig.queue.clone();
        let drain = tokio::spawn(async move { queue.process_queue().await });
        entered.notified().await;

        rig.queue.detach().await;
        rig.queue.attach("race-1").await;
        release.notify_one();

        let report = drain.await.unwrap();
        assert!(report.discarded);
        // Reloaded from storage and still pending under the same race.
        assert_eq!(rig.queue.queue_length(), 1);
    }

    #[tokio::test]
    async fn test_senders_receive_attached_race() {
        let rig = rig().await;
        let races = Arc::new(Mutex::new(Vec::new()));
        let seen = races.clone();
        rig.queue.initialize(Arc::new(move |race_id: String, _entry| {
            seen.lock().unwrap().push(race_id);
            Box::pin(async { Ok(()) })
        }));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;

        rig.queue.detach().await;
        rig.queue.attach("race-2").await;
        rig.queue.enqueue(entry("e2", "dev-a"), None).await;
        rig.clock.set(1_000);
        rig.queue.process_queue().await;

        // e1 stays persisted under race-1 and is never sent while race-2 is attached.
        assert_eq!(*races.lock().unwrap(), vec!["race-2".to_string()]);
        let race_1 = QueueStore::<Entry>::load_queue(&*rig.store, "race-1").await.unwrap();
        assert_eq!(race_1.len(), 1);
        assert_eq!(race_1[0].entry.id, "e1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timer() {
        let rig = rig().await;
        let calls = Arc::new(AtomicUsize::new(0));
        rig.queue.initialize(counting_sender(|| Ok(()), calls.clone()));
        rig.queue.enqueue(entry("e1", "dev-a"), None).await;
        rig.clock.set(5_000);

        rig.queue.start();
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rig.queue.queue_length(), 0);
        rig.queue.stop();
    }
}
