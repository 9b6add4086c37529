//! # Sync Coordinator
//!
//! Runs the fetch-and-merge cycle for entries and faults and exposes the
//! send/delete operations the rest of the app uses.
//!
//! ## Fetch Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  PollingManager tick ──► poll_tick()                                    │
//! │                             │                                           │
//! │            ┌────────────────┴────────────────┐                          │
//! │            ▼                                 ▼                          │
//! │   fetch_cloud_entries()            fetch_cloud_faults()                 │
//! │   (in flight? share it)            (in flight? share it)                │
//! │            │                                 │                          │
//! │            ▼                                 ▼                          │
//! │   GET /sync?raceId&deviceId&deviceName[&since]                          │
//! │            │                                                            │
//! │            ├─ deleted: true ────────► tear down, RaceDeleted            │
//! │            ├─ 401 expired ──────────► tear down, AuthExpired            │
//! │            ├─ race switched ────────► discard                           │
//! │            ▼                                                            │
//! │   drop ill-formed records ─► apply deletedIds ─► merge (idempotent)     │
//! │            │                                                            │
//! │            ▼                                                            │
//! │   cursor = max(cursor, lastUpdated) ─► adjust_polling_interval          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submit Path
//! ```text
//! submit_entry(e) ─► store locally ─► broadcast to sibling tabs
//!                 ─► reset_to_fast_polling
//!                 ─► online? ── yes ─► POST ── ok ─► mark synced
//!                       │                └─ err ─► queue
//!                       └─ no ──► queue
//! ```

use futures_util::future::{BoxFuture, FutureExt, Shared};
use slalom_core::{
    BroadcastMessage, BroadcastPayload, ConnectionQuality, ConnectionStatus, CursorStore,
    EpochMillis, Entry, FaultEntry, GateRange, RecordKey, RecordKind, RecordStore, SyncRecord,
    MAX_BATCH_SIZE,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::{
    decode_records, DeleteBody, FetchQuery, FetchResponse, PostBody, PostResponse, SyncApi,
};
use crate::auth::AuthProvider;
use crate::broadcast::BroadcastManager;
use crate::clock::Clock;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::event::{SyncEvent, SyncEventEmitter};
use crate::monitor::NetworkMonitor;
use crate::operation::{RaceContext, RaceScope};
use crate::polling::PollingManager;
use crate::queue::QueueProcessor;
use crate::signal::Subscription;
use crate::status::StatusTracker;

type SharedFetch = Shared<BoxFuture<'static, SyncResult<FetchSummary>>>;

struct FetchSlot {
    id: u64,
    fut: SharedFetch,
}

/// Outcome of one successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub kind: RecordKind,
    pub merged: usize,
    pub removed: usize,
    pub discarded: usize,
    pub cursor: EpochMillis,
    pub has_changes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The cloud acknowledged the record.
    Sent,
    /// The record waits in the retry queue.
    Queued,
}

#[derive(Debug, Clone, Copy, Default)]
struct GateAssignment {
    range: Option<GateRange>,
    ready: bool,
}

enum Teardown {
    AuthExpired,
    RaceDeleted(String),
}

/// Collaborators of a [`SyncCoordinator`].
pub struct CoordinatorParts {
    pub device_id: String,
    pub device_name: String,
    pub api: Arc<dyn SyncApi>,
    pub auth: Arc<dyn AuthProvider>,
    pub entries: Arc<dyn RecordStore<Entry>>,
    pub faults: Arc<dyn RecordStore<FaultEntry>>,
    pub cursors: Arc<dyn CursorStore>,
    pub clock: Arc<dyn Clock>,
    pub network: Arc<dyn NetworkMonitor>,
    pub polling: Arc<PollingManager>,
    pub entry_queue: Arc<QueueProcessor<Entry>>,
    pub fault_queue: Arc<QueueProcessor<FaultEntry>>,
    pub broadcast: Arc<BroadcastManager>,
    pub emitter: Arc<dyn SyncEventEmitter>,
    pub request_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SyncCoordinator {
    me: Weak<SyncCoordinator>,
    device_id: String,
    device_name: String,
    api: Arc<dyn SyncApi>,
    auth: Arc<dyn AuthProvider>,
    entries: Arc<dyn RecordStore<Entry>>,
    faults: Arc<dyn RecordStore<FaultEntry>>,
    cursor_store: Arc<dyn CursorStore>,
    clock: Arc<dyn Clock>,
    network: Arc<dyn NetworkMonitor>,
    polling: Arc<PollingManager>,
    entry_queue: Arc<QueueProcessor<Entry>>,
    fault_queue: Arc<QueueProcessor<FaultEntry>>,
    broadcast: Arc<BroadcastManager>,
    emitter: Arc<dyn SyncEventEmitter>,
    scope: RaceScope,
    status: StatusTracker,
    entry_fetch: Mutex<Option<FetchSlot>>,
    fault_fetch: Mutex<Option<FetchSlot>>,
    fetch_seq: AtomicU64,
    cursors: Mutex<HashMap<RecordKind, EpochMillis>>,
    tombstones: Mutex<HashSet<(RecordKind, String)>>,
    gate: Mutex<GateAssignment>,
    last_quality: Mutex<ConnectionQuality>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SyncCoordinator {
    /// Builds the coordinator and wires the polling tick, queue senders,
    /// broadcast inbound handler and network signal to it.
    pub fn new(parts: CoordinatorParts) -> Arc<Self> {
        let quality = parts.network.connection_quality();
        let coordinator = Arc::new_cyclic(|me| SyncCoordinator {
            me: me.clone(),
            device_id: parts.device_id,
            device_name: parts.device_name,
            api: parts.api,
            auth: parts.auth,
            entries: parts.entries,
            faults: parts.faults,
            cursor_store: parts.cursors,
            clock: parts.clock,
            network: parts.network,
            polling: parts.polling,
            entry_queue: parts.entry_queue,
            fault_queue: parts.fault_queue,
            broadcast: parts.broadcast,
            emitter: parts.emitter,
            scope: RaceScope::new(parts.request_timeout),
            status: StatusTracker::new(),
            entry_fetch: Mutex::new(None),
            fault_fetch: Mutex::new(None),
            fetch_seq: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            gate: Mutex::new(GateAssignment::default()),
            last_quality: Mutex::new(quality),
            subscriptions: Mutex::new(Vec::new()),
        });
        coordinator.wire();
        coordinator
    }

    fn wire(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.polling.initialize(Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.poll_tick().await;
                }
            }
            .boxed()
        }));

        let weak = Arc::downgrade(self);
        self.entry_queue.initialize(Arc::new(move |race_id: String, entry: Entry| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(coordinator) => coordinator.send_queued_entry(&race_id, entry).await,
                    None => Err(SyncError::NotInitialized),
                }
            }
            .boxed()
        }));

        let weak = Arc::downgrade(self);
        self.entry_queue.initialize_batch(Arc::new(move |race_id: String, entries: Vec<Entry>| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(coordinator) => coordinator.send_queued_entries(&race_id, entries).await,
                    None => Err(SyncError::NotInitialized),
                }
            }
            .boxed()
        }));

        let weak = Arc::downgrade(self);
        self.fault_queue.initialize(Arc::new(move |race_id: String, fault: FaultEntry| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(coordinator) => coordinator.send_queued_fault(&race_id, fault).await,
                    None => Err(SyncError::NotInitialized),
                }
            }
            .boxed()
        }));

        let weak = Arc::downgrade(self);
        self.broadcast.set_inbound(Arc::new(move |message: BroadcastMessage| {
            let weak = weak.clone();
            async move {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.apply_broadcast(message).await;
                }
            }
            .boxed()
        }));

        let mut subscriptions = Vec::with_capacity(2);

        let emitter = Arc::clone(&self.emitter);
        subscriptions.push(
            self.status
                .subscribe(move |status| emitter.emit(&SyncEvent::StatusChanged(status))),
        );

        let weak = Arc::downgrade(self);
        subscriptions.push(self.network.on_quality_change(Box::new(move |quality| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_network_change(quality);
            }
        })));

        *lock(&self.subscriptions) = subscriptions;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Binds the coordinator to a race. Re-initializing with the active race
    /// is a no-op; another race tears the current one down first.
    pub async fn initialize(&self, race_id: &str) -> SyncResult<()> {
        let race_id = race_id.trim();
        if race_id.is_empty() {
            return Err(SyncError::InvalidConfig("race id must not be empty".into()));
        }
        match self.scope.current() {
            Some(ctx) if ctx.race_id == race_id => return Ok(()),
            Some(_) => self.cleanup().await,
            None => {}
        }

        let ctx = self.scope.begin(race_id);
        self.status.transition(ConnectionStatus::Disconnected);
        self.status.transition(ConnectionStatus::Connecting);

        for kind in [RecordKind::Entry, RecordKind::Fault] {
            let cursor = match self.cursor_store.load_cursor(race_id, kind).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    error!(
                        race_id = %race_id,
                        kind = %kind,
                        error = %e,
                        "Failed to load sync cursor"
                    );
                    0
                }
            };
            lock(&self.cursors).insert(kind, cursor);
        }

        self.entry_queue.attach(race_id).await;
        self.fault_queue.attach(race_id).await;
        self.scope.ensure_current(&ctx)?;

        self.broadcast.initialize(race_id);
        self.broadcast.broadcast_presence();

        self.polling.reset_to_fast_polling();
        self.polling.start();
        self.entry_queue.start();
        self.fault_queue.start();

        if self.is_offline() {
            self.status.transition(ConnectionStatus::Offline);
        }

        info!(
            race_id = %race_id,
            device_id = %self.device_id,
            pending_entries = self.entry_queue.queue_length(),
            pending_faults = self.fault_queue.queue_length(),
            "Sync coordinator initialized"
        );
        Ok(())
    }

    /// Triggers an immediate poll tick without waiting for it.
    pub fn refresh(&self) {
        self.polling.refresh_now();
    }

    /// Stops timers, persists queues and closes the broadcast channel.
    /// Safe to call when not initialized.
    pub async fn cleanup(&self) {
        let previous = self.scope.end();
        self.polling.stop();
        self.entry_queue.stop();
        self.fault_queue.stop();
        self.entry_queue.detach().await;
        self.fault_queue.detach().await;
        self.broadcast.cleanup();

        *lock(&self.entry_fetch) = None;
        *lock(&self.fault_fetch) = None;
        lock(&self.cursors).clear();
        lock(&self.tombstones).clear();

        self.status.transition(ConnectionStatus::Disconnected);
        if let Some(ctx) = previous {
            info!(race_id = %ctx.race_id, "Sync coordinator cleaned up");
        }
    }

    /// Cleans up and drops every signal subscription.
    pub async fn shutdown(&self) {
        self.cleanup().await;
        self.polling.shutdown();
        lock(&self.subscriptions).clear();
    }

    // =========================================================================
    // Fetch Path
    // =========================================================================

    /// One polling tick: fetch both families and feed the outcome back into
    /// the polling schedule.
    pub async fn poll_tick(self: &Arc<Self>) {
        if self.scope.current().is_none() {
            return;
        }
        let (entries, faults) = self.fetch_both().await;
        self.report_tick(&[entries, faults]);
    }

    /// Fetches both families and drains both queues. Returns the first
    /// fetch error.
    pub async fn sync_now(self: &Arc<Self>) -> SyncResult<()> {
        self.scope.require()?;
        let (entries, faults) = self.fetch_both().await;
        self.report_tick(&[entries.clone(), faults.clone()]);

        self.entry_queue.process_queue().await;
        self.fault_queue.process_queue().await;

        entries?;
        faults?;
        Ok(())
    }

    /// Rewinds both cursors to zero and fetches everything again.
    pub async fn force_full_resync(self: &Arc<Self>) -> SyncResult<()> {
        let ctx = self.scope.require()?;
        {
            let mut cursors = lock(&self.cursors);
            cursors.insert(RecordKind::Entry, 0);
            cursors.insert(RecordKind::Fault, 0);
        }
        lock(&self.tombstones).clear();
        for kind in [RecordKind::Entry, RecordKind::Fault] {
            self.cursor_store.save_cursor(&ctx.race_id, kind, 0).await?;
        }
        info!(race_id = %ctx.race_id, "Full resync requested");

        let (entries, faults) = self.fetch_both().await;
        self.report_tick(&[entries.clone(), faults.clone()]);
        entries?;
        faults?;
        Ok(())
    }

    pub async fn fetch_cloud_entries(self: &Arc<Self>) -> SyncResult<FetchSummary> {
        self.coalesced_fetch(RecordKind::Entry).await
    }

    pub async fn fetch_cloud_faults(self: &Arc<Self>) -> SyncResult<FetchSummary> {
        self.coalesced_fetch(RecordKind::Fault).await
    }

    async fn fetch_both(self: &Arc<Self>) -> (SyncResult<FetchSummary>, SyncResult<FetchSummary>) {
        futures_util::future::join(self.fetch_cloud_entries(), self.fetch_cloud_faults()).await
    }

    fn report_tick(&self, results: &[SyncResult<FetchSummary>]) {
        let mut has_changes = false;
        let mut succeeded = false;
        let mut failed = false;
        let mut offline = false;

        for result in results {
            match result {
                Ok(summary) => {
                    succeeded = true;
                    has_changes |= summary.has_changes;
                }
                Err(err) => match err.class() {
                    ErrorClass::Connectivity => offline = true,
                    ErrorClass::RaceChanged | ErrorClass::AuthExpired => {}
                    _ => failed = true,
                },
            }
        }

        if offline {
            self.polling.report_connectivity_loss();
        } else if failed {
            self.polling.adjust_polling_interval(false, false);
        } else if succeeded {
            self.polling.adjust_polling_interval(true, has_changes);
        }
    }

    fn fetch_slot(&self, kind: RecordKind) -> &Mutex<Option<FetchSlot>> {
        match kind {
            RecordKind::Entry => &self.entry_fetch,
            RecordKind::Fault => &self.fault_fetch,
        }
    }

    /// Returns the in-flight fetch of `kind`, or starts one.
    fn coalesced_fetch(self: &Arc<Self>, kind: RecordKind) -> SharedFetch {
        let mut slot = lock(self.fetch_slot(kind));
        if let Some(existing) = slot.as_ref() {
            debug!(kind = %kind, "Fetch already in flight, sharing it");
            return existing.fut.clone();
        }

        let id = self.fetch_seq.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let fut = async move {
            let result = this.run_fetch(kind).await;
            let mut slot = lock(this.fetch_slot(kind));
            if slot.as_ref().is_some_and(|s| s.id == id) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared();

        *slot = Some(FetchSlot { id, fut: fut.clone() });
        fut
    }

    async fn run_fetch(&self, kind: RecordKind) -> SyncResult<FetchSummary> {
        let result = match kind {
            RecordKind::Entry => self.fetch_records(&self.entries).await,
            RecordKind::Fault => self.fetch_records(&self.faults).await,
        };
        match &result {
            Ok(summary) => {
                if summary.has_changes || summary.discarded > 0 {
                    info!(
                        kind = %kind,
                        merged = summary.merged,
                        removed = summary.removed,
                        discarded = summary.discarded,
                        cursor = summary.cursor,
                        "Fetched cloud changes"
                    );
                }
                self.emitter.emit(&SyncEvent::FetchCompleted {
                    kind,
                    merged: summary.merged,
                    removed: summary.removed,
                    discarded: summary.discarded,
                    cursor: summary.cursor,
                });
            }
            Err(err) => self.on_fetch_error(kind, err),
        }
        result
    }

    async fn fetch_records<T: SyncRecord>(
        &self,
        store: &Arc<dyn RecordStore<T>>,
    ) -> SyncResult<FetchSummary> {
        let kind = T::KIND;
        let ctx = self.scope.require()?;
        if self.is_offline() {
            return Err(SyncError::Offline);
        }

        let since = self.cursor(kind);
        let gate = match kind {
            RecordKind::Fault => lock(&self.gate).range,
            RecordKind::Entry => None,
        };
        let query = FetchQuery {
            race_id: ctx.race_id.clone(),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            since: (since > 0).then_some(since),
            gate_start: gate.map(|g| g.start),
            gate_end: gate.map(|g| g.end),
        };

        self.status.transition(ConnectionStatus::Syncing);
        let response = self.scope.run(&ctx, self.api.fetch(kind, &query)).await?;
        if response.deleted {
            return Err(SyncError::RaceDeleted(ctx.race_id.clone()));
        }

        let FetchResponse {
            entries,
            deleted_ids,
            last_updated,
            device_count,
            highest_bib,
            ..
        } = response;

        let (records, discarded) = decode_records::<T>(entries);
        if discarded > 0 {
            warn!(
                kind = %kind,
                race_id = %ctx.race_id,
                discarded,
                "Discarded ill-formed records from fetch"
            );
        }

        let removed = if deleted_ids.is_empty() {
            0
        } else {
            self.scope.ensure_current(&ctx)?;
            {
                let mut tombstones = lock(&self.tombstones);
                tombstones.extend(deleted_ids.iter().map(|id| (kind, id.clone())));
            }
            store.remove(&ctx.race_id, &deleted_ids).await?
        };

        let records: Vec<T> = {
            let tombstones = lock(&self.tombstones);
            records
                .into_iter()
                .filter(|record| !tombstones.contains(&(kind, record.id().to_string())))
                .collect()
        };

        self.scope.ensure_current(&ctx)?;
        let merged = store.merge(&ctx.race_id, records).await?;
        self.scope.ensure_current(&ctx)?;

        let cursor = match last_updated {
            Some(watermark) => self.advance_cursor(&ctx, kind, watermark).await,
            None => self.cursor(kind),
        };

        if !merged.is_empty() {
            self.detect_duplicates(&ctx, store, &merged).await;
        }
        if device_count.is_some() || highest_bib.is_some() {
            self.emitter.emit(&SyncEvent::CloudInfo {
                device_count,
                highest_bib,
            });
        }

        self.status.transition(ConnectionStatus::Connected);
        Ok(FetchSummary {
            kind,
            merged: merged.len(),
            removed,
            discarded,
            cursor,
            has_changes: !merged.is_empty() || removed > 0,
        })
    }

    /// Moves the cursor forward. An older watermark never rewinds it.
    async fn advance_cursor(
        &self,
        ctx: &RaceContext,
        kind: RecordKind,
        watermark: EpochMillis,
    ) -> EpochMillis {
        let advanced = {
            let mut cursors = lock(&self.cursors);
            let current = cursors.entry(kind).or_insert(0);
            if watermark > *current {
                *current = watermark;
                true
            } else {
                if watermark < *current {
                    debug!(kind = %kind, watermark, cursor = *current, "Ignoring older watermark");
                }
                false
            }
        };

        if advanced {
            if let Err(e) = self.cursor_store.save_cursor(&ctx.race_id, kind, watermark).await {
                error!(
                    race_id = %ctx.race_id,
                    kind = %kind,
                    error = %e,
                    "Failed to persist sync cursor"
                );
            }
        }
        self.cursor(kind)
    }

    async fn detect_duplicates<T: SyncRecord>(
        &self,
        ctx: &RaceContext,
        store: &Arc<dyn RecordStore<T>>,
        merged: &[T],
    ) {
        let all = match store.list(&ctx.race_id).await {
            Ok(all) => all,
            Err(e) => {
                debug!(error = %e, "Skipping duplicate detection");
                return;
            }
        };

        let mut devices_by_key: HashMap<String, BTreeSet<String>> = HashMap::new();
        for record in &all {
            devices_by_key
                .entry(record.duplicate_key())
                .or_default()
                .insert(record.device_id().to_string());
        }

        let mut reported = HashSet::new();
        for record in merged {
            let key = record.duplicate_key();
            if !reported.insert(key.clone()) {
                continue;
            }
            if let Some(devices) = devices_by_key.get(&key).filter(|d| d.len() > 1) {
                warn!(
                    kind = %T::KIND,
                    key = %key,
                    devices = devices.len(),
                    "Same event recorded on several devices"
                );
                self.emitter.emit(&SyncEvent::DuplicateDetected {
                    kind: T::KIND,
                    key,
                    device_ids: devices.iter().cloned().collect(),
                });
            }
        }
    }

    fn on_fetch_error(&self, kind: RecordKind, err: &SyncError) {
        match err.class() {
            ErrorClass::Connectivity => {
                debug!(kind = %kind, error = %err, "Fetch skipped, no connectivity");
                self.status.transition(ConnectionStatus::Offline);
            }
            ErrorClass::AuthExpired => self.begin_teardown(Teardown::AuthExpired),
            ErrorClass::RaceChanged => {
                if let SyncError::RaceDeleted(race_id) = err {
                    self.begin_teardown(Teardown::RaceDeleted(race_id.clone()));
                } else {
                    debug!(kind = %kind, error = %err, "Fetch result discarded");
                    return;
                }
            }
            ErrorClass::Server | ErrorClass::Malformed | ErrorClass::Rejected => {
                if err.is_retryable() {
                    warn!(kind = %kind, error = %err, "Fetch failed, retrying on the next tick");
                } else {
                    warn!(
                        kind = %kind,
                        error = %err,
                        "Fetch rejected, check the race and device settings"
                    );
                }
                self.status.transition(ConnectionStatus::Error);
            }
            ErrorClass::Internal => {
                error!(kind = %kind, error = %err, "Fetch failed locally");
                self.status.transition(ConnectionStatus::Error);
            }
        }
        self.emitter.emit(&SyncEvent::FetchFailed {
            kind,
            class: err.class(),
            message: err.to_string(),
        });
    }

    // =========================================================================
    // Send Path
    // =========================================================================

    pub async fn send_entry_to_cloud(&self, entry: Entry) -> SyncResult<()> {
        let ctx = self.scope.require()?;
        self.send_entry_in(&ctx, entry).await
    }

    pub async fn send_fault_to_cloud(&self, fault: FaultEntry) -> SyncResult<()> {
        let ctx = self.scope.require()?;
        self.send_fault_in(&ctx, fault).await
    }

    /// Posts up to [`MAX_BATCH_SIZE`] entries per request. Returns success
    /// per entry id.
    pub async fn send_entries_to_cloud_batch(
        &self,
        entries: Vec<Entry>,
    ) -> SyncResult<HashMap<String, bool>> {
        let ctx = self.scope.require()?;
        self.send_entries_in(&ctx, entries).await
    }

    /// The active context, if it is still the race a queued record belongs to.
    fn queued_context(&self, race_id: &str) -> SyncResult<RaceContext> {
        match self.scope.current() {
            Some(ctx) if ctx.race_id == race_id => Ok(ctx),
            Some(_) => Err(SyncError::RaceChanged),
            None => Err(SyncError::NotInitialized),
        }
    }

    async fn send_queued_entry(&self, race_id: &str, entry: Entry) -> SyncResult<()> {
        let ctx = self.queued_context(race_id)?;
        self.send_entry_in(&ctx, entry).await
    }

    async fn send_queued_entries(
        &self,
        race_id: &str,
        entries: Vec<Entry>,
    ) -> SyncResult<HashMap<String, bool>> {
        let ctx = self.queued_context(race_id)?;
        self.send_entries_in(&ctx, entries).await
    }

    async fn send_queued_fault(&self, race_id: &str, fault: FaultEntry) -> SyncResult<()> {
        let ctx = self.queued_context(race_id)?;
        self.send_fault_in(&ctx, fault).await
    }

    async fn send_entry_in(&self, ctx: &RaceContext, entry: Entry) -> SyncResult<()> {
        let body = PostBody::single(&entry, &self.device_id, &self.device_name)?;
        self.post_single(ctx, &self.entries, entry, body).await
    }

    async fn send_fault_in(&self, ctx: &RaceContext, fault: FaultEntry) -> SyncResult<()> {
        let gate = *lock(&self.gate);
        let body = PostBody::single(&fault, &self.device_id, &self.device_name)?
            .with_gate_state(gate.range, gate.ready);
        self.post_single(ctx, &self.faults, fault, body).await
    }

    async fn send_entries_in(
        &self,
        ctx: &RaceContext,
        entries: Vec<Entry>,
    ) -> SyncResult<HashMap<String, bool>> {
        if self.is_offline() {
            return Err(SyncError::Offline);
        }

        let mut results = HashMap::with_capacity(entries.len());
        for chunk in entries.chunks(MAX_BATCH_SIZE) {
            let (valid, invalid): (Vec<&Entry>, Vec<&Entry>) =
                chunk.iter().partition(|e| e.validate().is_ok());
            for entry in invalid {
                warn!(id = %entry.id, "Entry failed validation, not sending");
                results.insert(entry.id.clone(), false);
            }
            if valid.is_empty() {
                continue;
            }

            let valid: Vec<Entry> = valid.into_iter().cloned().collect();
            let body = PostBody::batch(&valid, &self.device_id, &self.device_name)?;
            let response = self.post(ctx, RecordKind::Entry, &body).await?;

            let acked: HashMap<String, bool> = match &response.results {
                Some(per_item) => per_item.iter().map(|r| (r.id.clone(), r.success)).collect(),
                None => valid.iter().map(|e| (e.id.clone(), response.success)).collect(),
            };
            if response.has_cross_device_duplicate() {
                warn!(
                    race_id = %ctx.race_id,
                    "Batch contains events already recorded by another device"
                );
            }

            for entry in &valid {
                let ok = acked.get(&entry.id).copied().unwrap_or(false);
                if ok {
                    self.mark_synced(ctx, &self.entries, &entry.key()).await;
                    self.emitter.emit(&SyncEvent::Sent {
                        kind: RecordKind::Entry,
                        id: entry.id.clone(),
                    });
                }
                results.insert(entry.id.clone(), ok);
            }
        }

        debug!(
            sent = results.values().filter(|ok| **ok).count(),
            total = results.len(),
            "Batch send complete"
        );
        Ok(results)
    }

    pub async fn delete_entry_from_cloud(&self, entry_id: &str) -> SyncResult<bool> {
        self.delete_remote(RecordKind::Entry, entry_id).await
    }

    pub async fn delete_fault_from_cloud(&self, fault_id: &str) -> SyncResult<bool> {
        self.delete_remote(RecordKind::Fault, fault_id).await
    }

    async fn post_single<T: SyncRecord>(
        &self,
        ctx: &RaceContext,
        store: &Arc<dyn RecordStore<T>>,
        record: T,
        body: PostBody,
    ) -> SyncResult<()> {
        record.validate()?;
        if self.is_offline() {
            return Err(SyncError::Offline);
        }

        let response = self.post(ctx, T::KIND, &body).await?;
        if !response.success {
            return Err(SyncError::Rejected {
                status: 200,
                message: "server did not accept the record".into(),
            });
        }

        if response.has_cross_device_duplicate() {
            warn!(kind = %T::KIND, id = %record.id(), "Event already recorded by another device");
            self.emitter.emit(&SyncEvent::CrossDeviceDuplicate {
                kind: T::KIND,
                id: record.id().to_string(),
            });
        }
        if response.photo_skipped {
            warn!(id = %record.id(), "Server skipped the photo");
            self.emitter.emit(&SyncEvent::PhotoSkipped {
                id: record.id().to_string(),
            });
        }

        self.mark_synced(ctx, store, &record.key()).await;
        self.emitter.emit(&SyncEvent::Sent {
            kind: T::KIND,
            id: record.id().to_string(),
        });
        Ok(())
    }

    async fn post(
        &self,
        ctx: &RaceContext,
        kind: RecordKind,
        body: &PostBody,
    ) -> SyncResult<PostResponse> {
        let response = self
            .scope
            .run(ctx, self.api.post(kind, &ctx.race_id, body))
            .await
            .map_err(|e| self.on_send_error(e))?;
        if response.deleted {
            return Err(self.on_send_error(SyncError::RaceDeleted(ctx.race_id.clone())));
        }
        Ok(response)
    }

    async fn delete_remote(&self, kind: RecordKind, id: &str) -> SyncResult<bool> {
        let ctx = self.scope.require()?;
        if self.is_offline() {
            return Err(SyncError::Offline);
        }

        let body = DeleteBody::new(kind, id, &self.device_id, &self.device_name);
        let response = self
            .scope
            .run(&ctx, self.api.delete(kind, &ctx.race_id, &body))
            .await
            .map_err(|e| self.on_send_error(e))?;
        if response.deleted {
            return Err(self.on_send_error(SyncError::RaceDeleted(ctx.race_id.clone())));
        }
        debug!(kind = %kind, id = %id, success = response.success, "Delete sent");
        Ok(response.success)
    }

    fn on_send_error(&self, err: SyncError) -> SyncError {
        match &err {
            SyncError::AuthExpired => self.begin_teardown(Teardown::AuthExpired),
            SyncError::RaceDeleted(race_id) => {
                self.begin_teardown(Teardown::RaceDeleted(race_id.clone()))
            }
            _ if err.is_connectivity() => {
                self.status.transition(ConnectionStatus::Offline);
            }
            _ => {}
        }
        err
    }

    async fn mark_synced<T: SyncRecord>(
        &self,
        ctx: &RaceContext,
        store: &Arc<dyn RecordStore<T>>,
        key: &RecordKey,
    ) {
        if !self.scope.is_current(ctx) {
            return;
        }
        if let Err(e) = store.mark_synced(&ctx.race_id, key, self.clock.now_ms()).await {
            error!(kind = %T::KIND, key = %key, error = %e, "Failed to mark record synced");
        }
    }

    // =========================================================================
    // Submit Path
    // =========================================================================

    /// Records a locally captured entry and gets it to the cloud, directly
    /// or through the retry queue.
    ///
    /// Every step runs under the race that was active when the call was
    /// made. If the race changes meanwhile the record stays stored under its
    /// own race and the call fails with `RaceChanged`.
    pub async fn submit_entry(&self, entry: Entry) -> SyncResult<SubmitOutcome> {
        let ctx = self.scope.require()?;
        self.store_local(&ctx, &self.entries, &entry).await?;
        self.broadcast.broadcast_entry(&entry);
        self.polling.reset_to_fast_polling();

        let result = if self.is_offline() {
            Err(SyncError::Offline)
        } else {
            self.send_entry_in(&ctx, entry.clone()).await
        };
        self.finish_submit(&ctx, &self.entry_queue, entry, result).await
    }

    pub async fn submit_fault(&self, fault: FaultEntry) -> SyncResult<SubmitOutcome> {
        let ctx = self.scope.require()?;
        self.store_local(&ctx, &self.faults, &fault).await?;
        self.broadcast.broadcast_fault(&fault);
        self.polling.reset_to_fast_polling();

        let result = if self.is_offline() {
            Err(SyncError::Offline)
        } else {
            self.send_fault_in(&ctx, fault.clone()).await
        };
        self.finish_submit(&ctx, &self.fault_queue, fault, result).await
    }

    /// Removes a fault locally, tells sibling tabs and deletes it in the
    /// cloud.
    pub async fn remove_fault(&self, fault_id: &str) -> SyncResult<bool> {
        let ctx = self.scope.require()?;
        self.faults.remove(&ctx.race_id, &[fault_id.to_string()]).await?;
        lock(&self.tombstones).insert((RecordKind::Fault, fault_id.to_string()));
        self.broadcast.broadcast_fault_deletion(fault_id);
        self.polling.reset_to_fast_polling();
        self.delete_fault_from_cloud(fault_id).await
    }

    /// Stores the record under `ctx` and checks the race is still active
    /// before anything else sees it.
    async fn store_local<T: SyncRecord>(
        &self,
        ctx: &RaceContext,
        store: &Arc<dyn RecordStore<T>>,
        record: &T,
    ) -> SyncResult<()> {
        record.validate()?;
        store.merge(&ctx.race_id, vec![record.clone()]).await?;
        self.scope.ensure_current(ctx)
    }

    async fn finish_submit<T: SyncRecord>(
        &self,
        ctx: &RaceContext,
        queue: &QueueProcessor<T>,
        record: T,
        result: SyncResult<()>,
    ) -> SyncResult<SubmitOutcome> {
        let err = match result {
            Ok(()) => return Ok(SubmitOutcome::Sent),
            Err(err) => err,
        };
        if matches!(err.class(), ErrorClass::RaceChanged | ErrorClass::AuthExpired) {
            return Err(err);
        }
        // Only the queue of the record's own race may take it.
        match queue.race_id() {
            None => return Err(SyncError::NotInitialized),
            Some(race_id) if race_id != ctx.race_id || !self.scope.is_current(ctx) => {
                return Err(SyncError::RaceChanged)
            }
            Some(_) => {}
        }

        let id = record.id().to_string();
        let note = (!err.is_connectivity()).then(|| err.to_string());
        if queue.enqueue(record, note).await {
            debug!(kind = %T::KIND, id = %id, reason = %err, "Queued for later sync");
            self.emitter.emit(&SyncEvent::Queued { kind: T::KIND, id });
        }
        Ok(SubmitOutcome::Queued)
    }

    // =========================================================================
    // Signals
    // =========================================================================

    fn on_network_change(&self, quality: ConnectionQuality) {
        let previous = std::mem::replace(&mut *lock(&self.last_quality), quality);
        if previous == quality || self.scope.current().is_none() {
            return;
        }

        if quality == ConnectionQuality::Offline {
            info!("Network went offline");
            self.status.transition(ConnectionStatus::Offline);
        } else if previous == ConnectionQuality::Offline {
            info!(quality = %quality, "Network back online");
            self.status.transition(ConnectionStatus::Connecting);
            self.polling.reset_to_fast_polling();
            self.polling.refresh_now();

            let (entry_queue, fault_queue) = (
                Arc::clone(&self.entry_queue),
                Arc::clone(&self.fault_queue),
            );
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    entry_queue.process_queue().await;
                    fault_queue.process_queue().await;
                });
            }
        }
    }

    async fn apply_broadcast(&self, message: BroadcastMessage) {
        let Some(ctx) = self.scope.current() else {
            return;
        };
        let device_id = message.device_id.clone();

        match message.payload {
            BroadcastPayload::Entry(entry) => {
                self.merge_remote(&ctx, &self.entries, entry, device_id).await
            }
            BroadcastPayload::Fault(fault) => {
                self.merge_remote(&ctx, &self.faults, fault, device_id).await
            }
            BroadcastPayload::FaultDeleted { fault_id } => {
                lock(&self.tombstones).insert((RecordKind::Fault, fault_id.clone()));
                match self.faults.remove(&ctx.race_id, &[fault_id.clone()]).await {
                    Ok(0) => {}
                    Ok(_) => self.emitter.emit(&SyncEvent::RemoteChange {
                        kind: RecordKind::Fault,
                        id: fault_id,
                        device_id,
                    }),
                    Err(e) => error!(error = %e, "Failed to apply broadcast fault deletion"),
                }
            }
            BroadcastPayload::Presence(presence) => self.emitter.emit(&SyncEvent::Presence {
                device_id,
                device_name: presence.device_name,
            }),
        }
    }

    async fn merge_remote<T: SyncRecord>(
        &self,
        ctx: &RaceContext,
        store: &Arc<dyn RecordStore<T>>,
        record: T,
        device_id: Option<String>,
    ) {
        if let Err(e) = record.validate() {
            debug!(kind = %T::KIND, error = %e, "Ignoring invalid broadcast record");
            return;
        }
        if !self.scope.is_current(ctx) {
            return;
        }
        let id = record.id().to_string();
        match store.merge(&ctx.race_id, vec![record]).await {
            Ok(inserted) if !inserted.is_empty() => {
                debug!(kind = %T::KIND, id = %id, "Merged record from sibling tab");
                self.emitter.emit(&SyncEvent::RemoteChange {
                    kind: T::KIND,
                    id,
                    device_id,
                });
            }
            Ok(_) => {}
            Err(e) => error!(kind = %T::KIND, error = %e, "Failed to merge broadcast record"),
        }
    }

    /// Stops issuing work right away. The rest runs on its own task so it
    /// survives the abort of the polling task it may be called from.
    fn begin_teardown(&self, reason: Teardown) {
        match &reason {
            Teardown::AuthExpired => {
                warn!("Authentication expired, stopping sync");
                self.emitter.emit(&SyncEvent::AuthExpired);
            }
            Teardown::RaceDeleted(race_id) => {
                if self.scope.current().map(|c| c.race_id) != Some(race_id.clone()) {
                    return;
                }
                warn!(race_id = %race_id, "Race was deleted on the server, stopping sync");
                self.emitter.emit(&SyncEvent::RaceDeleted {
                    race_id: race_id.clone(),
                });
            }
        }

        if self.scope.end().is_none() {
            return;
        }
        let Some(coordinator) = self.me.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if matches!(reason, Teardown::AuthExpired) {
                coordinator.auth.invalidate().await;
            }
            // A race initialized in the meantime is left alone.
            if coordinator.scope.current().is_none() {
                coordinator.cleanup().await;
            }
        });
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Sets the gate range sent with fault fetches and posts.
    pub fn set_gate_assignment(&self, range: Option<GateRange>, ready: bool) {
        *lock(&self.gate) = GateAssignment { range, ready };
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current()
    }

    pub fn subscribe_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(handler)
    }

    pub fn race_id(&self) -> Option<String> {
        self.scope.current().map(|ctx| ctx.race_id)
    }

    pub fn cursor(&self, kind: RecordKind) -> EpochMillis {
        lock(&self.cursors).get(&kind).copied().unwrap_or(0)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn polling(&self) -> &Arc<PollingManager> {
        &self.polling
    }

    pub fn entry_queue(&self) -> &Arc<QueueProcessor<Entry>> {
        &self.entry_queue
    }

    pub fn fault_queue(&self) -> &Arc<QueueProcessor<FaultEntry>> {
        &self.fault_queue
    }

    fn is_offline(&self) -> bool {
        self.network.connection_quality() == ConnectionQuality::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeleteResponse, PostResult};
    use crate::broadcast::BroadcastHub;
    use crate::test_support::{
        coordinator_rig, coordinator_rig_with, entry, eventually, fault, fetch_response, HeldMerge,
        Rig,
    };
    use serde_json::json;

    async fn started(device: &str) -> Rig {
        let rig = coordinator_rig(Arc::new(BroadcastHub::new()), device);
        rig.coordinator.initialize("race-1").await.unwrap();
        rig
    }

    fn wire(entry: &Entry) -> serde_json::Value {
        serde_json::to_value(entry).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(
            RecordKind::Entry,
            Ok(fetch_response(vec![wire(&entry("e1", "dev-b"))], &[], Some(10))),
        );
        let gate = rig.api.hold_fetches(RecordKind::Entry);

        let coordinator = Arc::clone(&rig.coordinator);
        let first = tokio::spawn(async move { coordinator.fetch_cloud_entries().await });
        gate.entered.notified().await;

        let (second, ()) = futures_util::future::join(rig.coordinator.fetch_cloud_entries(), async {
            gate.release.notify_one();
        })
        .await;
        let first = first.await.unwrap();

        assert_eq!(rig.api.fetch_count(RecordKind::Entry), 1);
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delta_sync_cursor_is_monotonic() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(RecordKind::Entry, Ok(fetch_response(vec![], &[], Some(100))));
        rig.api.push_fetch(RecordKind::Entry, Ok(fetch_response(vec![], &[], Some(50))));
        rig.api.push_fetch(RecordKind::Entry, Ok(fetch_response(vec![], &[], None)));

        rig.coordinator.fetch_cloud_entries().await.unwrap();
        let second = rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(second.cursor, 100);
        rig.coordinator.fetch_cloud_entries().await.unwrap();

        let queries = rig.api.fetches(RecordKind::Entry);
        assert_eq!(queries[0].since, None);
        assert_eq!(queries[1].since, Some(100));
        assert_eq!(queries[2].since, Some(100));
        assert_eq!(rig.store.load_cursor("race-1", RecordKind::Entry).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_refetch_is_idempotent() {
        let rig = started("dev-a").await;
        let response = fetch_response(vec![wire(&entry("e1", "dev-b"))], &[], Some(10));
        rig.api.push_fetch(RecordKind::Entry, Ok(response.clone()));
        rig.api.push_fetch(RecordKind::Entry, Ok(response));

        let first = rig.coordinator.fetch_cloud_entries().await.unwrap();
        let second = rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert!(first.has_changes);
        assert!(!second.has_changes);
        assert_eq!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tombstones_and_bad_records() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(
            RecordKind::Entry,
            Ok(fetch_response(
                vec![wire(&entry("e1", "dev-b")), json!({"id": "broken"})],
                &[],
                Some(10),
            )),
        );
        rig.api.push_fetch(
            RecordKind::Entry,
            Ok(fetch_response(vec![wire(&entry("e1", "dev-b"))], &["e1"], Some(20))),
        );

        let first = rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(first.merged, 1);
        assert_eq!(first.discarded, 1);

        let second = rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(second.removed, 1);
        assert_eq!(second.merged, 0);
        assert!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_race_switch_discards_fetch() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(
            RecordKind::Entry,
            Ok(fetch_response(vec![wire(&entry("e1", "dev-b"))], &[], Some(10))),
        );
        let gate = rig.api.hold_fetches(RecordKind::Entry);

        let coordinator = Arc::clone(&rig.coordinator);
        let fetch = tokio::spawn(async move { coordinator.fetch_cloud_entries().await });
        gate.entered.notified().await;

        rig.coordinator.initialize("race-2").await.unwrap();
        gate.release.notify_one();

        let err = fetch.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::RaceChanged);
        assert!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().is_empty());
        assert!(RecordStore::<Entry>::list(&*rig.store, "race-2").await.unwrap().is_empty());
        assert_eq!(rig.coordinator.cursor(RecordKind::Entry), 0);
    }

    #[tokio::test]
    async fn test_expired_token_tears_down() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(RecordKind::Entry, Err(SyncError::AuthExpired));

        let err = rig.coordinator.fetch_cloud_entries().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));

        let coordinator = Arc::clone(&rig.coordinator);
        eventually(move || coordinator.status() == ConnectionStatus::Disconnected).await;
        assert!(rig.coordinator.race_id().is_none());
        assert!(!rig.auth.is_authenticated().await);
        assert!(rig.emitter.events().contains(&SyncEvent::AuthExpired));
    }

    #[tokio::test]
    async fn test_deleted_race_tears_down() {
        let rig = started("dev-a").await;
        let body = r#"{"deleted":true,"message":"Race has been deleted"}"#;
        rig.api.push_fetch(RecordKind::Entry, Ok(serde_json::from_str(body).unwrap()));

        let err = rig.coordinator.fetch_cloud_entries().await.unwrap_err();
        assert!(matches!(err, SyncError::RaceDeleted(ref race) if race == "race-1"));

        let coordinator = Arc::clone(&rig.coordinator);
        eventually(move || coordinator.status() == ConnectionStatus::Disconnected).await;
        assert!(rig.emitter.events().contains(&SyncEvent::RaceDeleted {
            race_id: "race-1".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_fetch_keeps_cursor() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(
            RecordKind::Entry,
            Ok(fetch_response(vec![wire(&entry("e1", "dev-b"))], &[], Some(500))),
        );
        let _held = rig.api.hold_fetches(RecordKind::Entry);

        let err = rig.coordinator.fetch_cloud_entries().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(5_000)));
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Error);
        assert_eq!(rig.coordinator.cursor(RecordKind::Entry), 0);
        assert_eq!(rig.store.load_cursor("race-1", RecordKind::Entry).await.unwrap(), 0);
        assert!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().is_empty());

        // The abandoned response is delivered to the next fetch and applied once.
        let summary = rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(summary.cursor, 500);
        assert_eq!(rig.api.fetches(RecordKind::Entry)[1].since, None);
    }

    #[tokio::test]
    async fn test_status_follows_fetch_outcomes() {
        let rig = started("dev-a").await;
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Connecting);

        rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Connected);

        rig.api.push_fetch(
            RecordKind::Entry,
            Err(SyncError::ConnectionFailed("unreachable".into())),
        );
        rig.coordinator.fetch_cloud_entries().await.unwrap_err();
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Offline);

        rig.api.push_fetch(RecordKind::Entry, Err(SyncError::Timeout(10_000)));
        rig.coordinator.fetch_cloud_entries().await.unwrap_err();
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Error);

        rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_server_errors_slow_polling() {
        let rig = started("dev-a").await;
        for _ in 0..3 {
            rig.api.push_fetch(
                RecordKind::Entry,
                Err(SyncError::Server { status: 503, message: "down".into() }),
            );
            rig.coordinator.poll_tick().await;
        }
        assert_eq!(rig.coordinator.polling().consecutive_errors(), 3);
        assert_eq!(rig.coordinator.polling().current_interval(), Duration::from_secs(30));

        rig.coordinator.poll_tick().await;
        assert_eq!(rig.coordinator.polling().consecutive_errors(), 0);
        assert_eq!(rig.coordinator.polling().current_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_send_surfaces_server_warnings() {
        let rig = started("dev-a").await;
        let local = entry("e1", "dev-a");
        RecordStore::<Entry>::merge(&*rig.store, "race-1", vec![local.clone()]).await.unwrap();
        rig.api.push_post(Ok(PostResponse {
            success: true,
            cross_device_duplicate: Some(json!(true)),
            photo_skipped: true,
            ..PostResponse::default()
        }));

        rig.coordinator.send_entry_to_cloud(local).await.unwrap();

        let events = rig.emitter.events();
        assert!(events.contains(&SyncEvent::CrossDeviceDuplicate {
            kind: RecordKind::Entry,
            id: "e1".into()
        }));
        assert!(events.contains(&SyncEvent::PhotoSkipped { id: "e1".into() }));
        let stored = RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap();
        assert_eq!(stored[0].synced_at, Some(rig.clock.now_ms()));
    }

    #[tokio::test]
    async fn test_batch_send_maps_results_per_id() {
        let rig = started("dev-a").await;
        rig.api.push_post(Ok(PostResponse {
            success: true,
            results: Some(vec![
                PostResult { id: "e1".into(), success: true, error: None },
                PostResult { id: "e2".into(), success: false, error: Some("bad".into()) },
            ]),
            ..PostResponse::default()
        }));

        let results = rig
            .coordinator
            .send_entries_to_cloud_batch(vec![
                entry("e1", "dev-a"),
                entry("e2", "dev-a"),
                entry("e3", "dev-a"),
            ])
            .await
            .unwrap();
        assert_eq!(results.get("e1"), Some(&true));
        assert_eq!(results.get("e2"), Some(&false));
        assert_eq!(results.get("e3"), Some(&false));
        assert_eq!(rig.api.posts().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_paths() {
        let rig = started("dev-a").await;
        assert_eq!(
            rig.coordinator.submit_entry(entry("e1", "dev-a")).await.unwrap(),
            SubmitOutcome::Sent
        );

        rig.api.push_post(Err(SyncError::Server { status: 500, message: "boom".into() }));
        assert_eq!(
            rig.coordinator.submit_entry(entry("e2", "dev-a")).await.unwrap(),
            SubmitOutcome::Queued
        );
        let queued = rig.coordinator.entry_queue().items();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].error.is_some());

        rig.network.set_quality(ConnectionQuality::Offline);
        let posts_before = rig.api.posts().len();
        assert_eq!(
            rig.coordinator.submit_fault(fault("f1", "dev-a")).await.unwrap(),
            SubmitOutcome::Queued
        );
        assert_eq!(rig.api.posts().len(), posts_before);
        assert_eq!(rig.coordinator.fault_queue().queue_length(), 1);

        assert_eq!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_stays_on_its_race() {
        let mut held = None;
        let rig = coordinator_rig_with(Arc::new(BroadcastHub::new()), "dev-a", |store| {
            let store = Arc::new(HeldMerge::new(store));
            held = Some(Arc::clone(&store));
            store as Arc<dyn RecordStore<Entry>>
        });
        let held = held.unwrap();
        rig.coordinator.initialize("race-1").await.unwrap();

        let gate = held.hold();
        let coordinator = Arc::clone(&rig.coordinator);
        let submit =
            tokio::spawn(async move { coordinator.submit_entry(entry("e1", "dev-a")).await });
        gate.entered.notified().await;

        rig.coordinator.initialize("race-2").await.unwrap();
        gate.release.notify_one();

        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::RaceChanged));
        assert!(rig.api.posts().is_empty());
        assert_eq!(rig.coordinator.entry_queue().queue_length(), 0);
        assert_eq!(RecordStore::<Entry>::list(&*rig.store, "race-1").await.unwrap().len(), 1);
        assert!(RecordStore::<Entry>::list(&*rig.store, "race-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queued_sends_require_their_race() {
        let rig = started("dev-a").await;
        rig.coordinator.initialize("race-2").await.unwrap();

        let single = rig.coordinator.send_queued_entry("race-1", entry("e1", "dev-a")).await;
        assert!(matches!(single, Err(SyncError::RaceChanged)));
        let batch = rig
            .coordinator
            .send_queued_entries("race-1", vec![entry("e1", "dev-a"), entry("e2", "dev-a")])
            .await;
        assert!(matches!(batch, Err(SyncError::RaceChanged)));
        let judged = rig.coordinator.send_queued_fault("race-1", fault("f1", "dev-a")).await;
        assert!(matches!(judged, Err(SyncError::RaceChanged)));
        assert!(rig.api.posts().is_empty());

        rig.coordinator.send_queued_entry("race-2", entry("e3", "dev-a")).await.unwrap();
        assert_eq!(rig.api.posts()[0].1, "race-2");
    }

    #[tokio::test]
    async fn test_invalid_submit_is_rejected() {
        let rig = started("dev-a").await;
        let mut bad = entry("e1", "dev-a");
        bad.bib.clear();
        let err = rig.coordinator.submit_entry(bad).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));
        assert!(rig.api.posts().is_empty());
    }

    #[tokio::test]
    async fn test_fault_post_carries_gate_state() {
        let rig = started("dev-a").await;
        rig.coordinator.set_gate_assignment(Some(GateRange { start: 4, end: 8 }), true);
        rig.coordinator.send_fault_to_cloud(fault("f1", "dev-a")).await.unwrap();
        rig.coordinator.fetch_cloud_faults().await.unwrap();

        let (kind, _, body) = rig.api.posts().remove(0);
        assert_eq!(kind, RecordKind::Fault);
        assert_eq!(body.gate_range, Some(GateRange { start: 4, end: 8 }));
        assert_eq!(body.is_ready, Some(true));
        assert_eq!(rig.api.fetches(RecordKind::Fault)[0].gate_start, Some(4));
    }

    #[tokio::test]
    async fn test_duplicate_detection_across_devices() {
        let rig = started("dev-a").await;
        let mut mine = entry("e1", "dev-a");
        mine.bib = "42".into();
        rig.coordinator.submit_entry(mine).await.unwrap();

        let mut theirs = entry("e9", "dev-b");
        theirs.bib = "42".into();
        rig.api.push_fetch(
            RecordKind::Entry,
            Ok(fetch_response(vec![wire(&theirs)], &[], Some(5))),
        );
        rig.coordinator.fetch_cloud_entries().await.unwrap();

        let duplicate = rig.emitter.events().into_iter().find_map(|event| match event {
            SyncEvent::DuplicateDetected { device_ids, .. } => Some(device_ids),
            _ => None,
        });
        assert_eq!(duplicate, Some(vec!["dev-a".to_string(), "dev-b".to_string()]));
    }

    #[tokio::test]
    async fn test_full_resync_rewinds_cursor() {
        let rig = started("dev-a").await;
        rig.api.push_fetch(RecordKind::Entry, Ok(fetch_response(vec![], &[], Some(100))));
        rig.coordinator.fetch_cloud_entries().await.unwrap();
        assert_eq!(rig.coordinator.cursor(RecordKind::Entry), 100);

        rig.coordinator.force_full_resync().await.unwrap();
        let queries = rig.api.fetches(RecordKind::Entry);
        assert_eq!(queries.last().unwrap().since, None);
    }

    #[tokio::test]
    async fn test_sibling_tab_merge_and_self_filter() {
        let hub = Arc::new(BroadcastHub::new());
        let a = coordinator_rig(Arc::clone(&hub), "dev-a");
        let b = coordinator_rig(Arc::clone(&hub), "dev-b");
        a.coordinator.initialize("race-1").await.unwrap();
        b.coordinator.initialize("race-1").await.unwrap();

        a.coordinator.submit_entry(entry("e1", "dev-a")).await.unwrap();

        let store = Arc::clone(&b.store);
        eventually(move || {
            futures_util::FutureExt::now_or_never(RecordStore::<Entry>::list(&*store, "race-1"))
                .and_then(Result::ok)
                .is_some_and(|list| list.len() == 1)
        })
        .await;
        assert!(b
            .emitter
            .events()
            .iter()
            .any(|e| matches!(e, SyncEvent::RemoteChange { id, .. } if id == "e1")));
        assert!(!a.emitter.events().iter().any(|e| matches!(e, SyncEvent::RemoteChange { .. })));
    }

    #[tokio::test]
    async fn test_network_signals_drive_status() {
        let rig = started("dev-a").await;
        rig.network.set_quality(ConnectionQuality::Offline);
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Offline);

        rig.network.set_quality(ConnectionQuality::Good);
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_remove_fault_everywhere() {
        let rig = started("dev-a").await;
        rig.coordinator.submit_fault(fault("f1", "dev-a")).await.unwrap();
        rig.api.push_delete(Ok(DeleteResponse { success: true, deleted: false }));

        assert!(rig.coordinator.remove_fault("f1").await.unwrap());
        assert!(RecordStore::<FaultEntry>::list(&*rig.store, "race-1").await.unwrap().is_empty());
        let (kind, race_id, body) = rig.api.deletes().remove(0);
        assert_eq!(kind, RecordKind::Fault);
        assert_eq!(race_id, "race-1");
        assert_eq!(body.fault_id.as_deref(), Some("f1"));

        // A later fetch still carrying the fault does not resurrect it.
        let stale = serde_json::to_value(fault("f1", "dev-a")).unwrap();
        rig.api.push_fetch(RecordKind::Fault, Ok(fetch_response(vec![stale], &[], Some(9))));
        rig.coordinator.fetch_cloud_faults().await.unwrap();
        assert!(RecordStore::<FaultEntry>::list(&*rig.store, "race-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_safe_twice() {
        let rig = started("dev-a").await;
        rig.coordinator.cleanup().await;
        rig.coordinator.cleanup().await;
        assert!(
            matches!(
                rig.coordinator.send_entry_to_cloud(entry("e1", "dev-a")).await,
                Err(SyncError::NotInitialized)
            )
        );
        assert!(!rig.coordinator.polling().is_running());
        assert_eq!(rig.coordinator.status(), ConnectionStatus::Disconnected);
    }
}
