//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use slalom_core::{
    BatteryStatus, ConnectionQuality, EpochMillis, Entry, EntryStatus, FaultEntry, FaultType,
    QueueStore, RecordKey, RecordKind, RecordStore, StoreResult, TimingPoint,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::api::{
    DeleteBody, DeleteResponse, FetchQuery, FetchResponse, PostBody, PostResponse, SyncApi,
};
use crate::auth::TokenAuth;
use crate::broadcast::{BroadcastHub, BroadcastManager};
use crate::clock::{FixedJitter, ManualClock};
use crate::config::{PollingSettings, QueueSettings};
use crate::coordinator::{CoordinatorParts, SyncCoordinator};
use crate::error::SyncResult;
use crate::event::RecordingEmitter;
use crate::memory::MemoryStore;
use crate::monitor::{ManualBatteryMonitor, ManualNetworkMonitor, ManualVisibilityMonitor};
use crate::polling::PollingManager;
use crate::queue::QueueProcessor;

pub fn entry(id: &str, device: &str) -> Entry {
    Entry {
        id: id.into(),
        bib: "42".into(),
        point: TimingPoint::Finish,
        run: 1,
        timestamp: Utc::now(),
        status: EntryStatus::Ok,
        device_id: device.into(),
        device_name: format!("Timer {device}"),
        photo: None,
        synced_at: None,
    }
}

pub fn fault(id: &str, device: &str) -> FaultEntry {
    FaultEntry {
        id: id.into(),
        bib: "42".into(),
        run: 1,
        gate_number: 5,
        fault_type: FaultType::MissedGate,
        timestamp: Utc::now(),
        device_id: device.into(),
        device_name: format!("Judge {device}"),
        gate_range: None,
        synced_at: None,
    }
}

pub fn fetch_response(
    entries: Vec<Value>,
    deleted_ids: &[&str],
    last_updated: Option<i64>,
) -> FetchResponse {
    FetchResponse {
        entries,
        deleted_ids: deleted_ids.iter().map(|id| id.to_string()).collect(),
        last_updated,
        ..FetchResponse::default()
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Holds one call until released.
#[derive(Default)]
pub struct CallGate {
    pub entered: Notify,
    pub release: Notify,
}

/// Scripted [`SyncApi`]. Unscripted calls succeed with an empty response.
#[derive(Default)]
pub struct FakeSyncApi {
    fetch_results: Mutex<HashMap<RecordKind, VecDeque<SyncResult<FetchResponse>>>>,
    post_results: Mutex<VecDeque<SyncResult<PostResponse>>>,
    delete_results: Mutex<VecDeque<SyncResult<DeleteResponse>>>,
    fetches: Mutex<Vec<(RecordKind, FetchQuery)>>,
    posts: Mutex<Vec<(RecordKind, String, PostBody)>>,
    deletes: Mutex<Vec<(RecordKind, String, DeleteBody)>>,
    gates: Mutex<HashMap<RecordKind, Arc<CallGate>>>,
}

impl FakeSyncApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fetch(&self, kind: RecordKind, result: SyncResult<FetchResponse>) {
        self.fetch_results.lock().unwrap().entry(kind).or_default().push_back(result);
    }

    pub fn push_post(&self, result: SyncResult<PostResponse>) {
        self.post_results.lock().unwrap().push_back(result);
    }

    pub fn push_delete(&self, result: SyncResult<DeleteResponse>) {
        self.delete_results.lock().unwrap().push_back(result);
    }

    pub fn hold_fetches(&self, kind: RecordKind) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        self.gates.lock().unwrap().insert(kind, Arc::clone(&gate));
        gate
    }

    pub fn fetches(&self, kind: RecordKind) -> Vec<FetchQuery> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, q)| q.clone())
            .collect()
    }

    pub fn fetch_count(&self, kind: RecordKind) -> usize {
        self.fetches(kind).len()
    }

    pub fn posts(&self) -> Vec<(RecordKind, String, PostBody)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<(RecordKind, String, DeleteBody)> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncApi for FakeSyncApi {
    async fn fetch(&self, kind: RecordKind, query: &FetchQuery) -> SyncResult<FetchResponse> {
        self.fetches.lock().unwrap().push((kind, query.clone()));
        let gate = self.gates.lock().unwrap().remove(&kind);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let scripted = self
            .fetch_results
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(FetchResponse::default()))
    }

    async fn post(
        &self,
        kind: RecordKind,
        race_id: &str,
        body: &PostBody,
    ) -> SyncResult<PostResponse> {
        self.posts.lock().unwrap().push((kind, race_id.to_string(), body.clone()));
        let scripted = self.post_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PostResponse {
                success: true,
                ..PostResponse::default()
            })
        })
    }

    async fn delete(
        &self,
        kind: RecordKind,
        race_id: &str,
        body: &DeleteBody,
    ) -> SyncResult<DeleteResponse> {
        self.deletes.lock().unwrap().push((kind, race_id.to_string(), body.clone()));
        let scripted = self.delete_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(DeleteResponse {
                success: true,
                deleted: false,
            })
        })
    }
}

/// Entry store whose next `merge` waits on a [`CallGate`].
pub struct HeldMerge {
    inner: Arc<MemoryStore>,
    gate: Mutex<Option<Arc<CallGate>>>,
}

impl HeldMerge {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        HeldMerge {
            inner,
            gate: Mutex::new(None),
        }
    }

    pub fn hold(&self) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl RecordStore<Entry> for HeldMerge {
    async fn merge(&self, race_id: &str, records: Vec<Entry>) -> StoreResult<Vec<Entry>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        RecordStore::<Entry>::merge(&*self.inner, race_id, records).await
    }

    async fn remove(&self, race_id: &str, ids: &[String]) -> StoreResult<usize> {
        RecordStore::<Entry>::remove(&*self.inner, race_id, ids).await
    }

    async fn mark_synced(
        &self,
        race_id: &str,
        key: &RecordKey,
        at: EpochMillis,
    ) -> StoreResult<bool> {
        RecordStore::<Entry>::mark_synced(&*self.inner, race_id, key, at).await
    }

    async fn list(&self, race_id: &str) -> StoreResult<Vec<Entry>> {
        RecordStore::<Entry>::list(&*self.inner, race_id).await
    }
}

/// A coordinator over in-memory collaborators.
pub struct Rig {
    pub coordinator: Arc<SyncCoordinator>,
    pub api: Arc<FakeSyncApi>,
    pub auth: Arc<TokenAuth>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub network: Arc<ManualNetworkMonitor>,
    pub emitter: Arc<RecordingEmitter>,
}

pub fn coordinator_rig(hub: Arc<BroadcastHub>, device_id: &str) -> Rig {
    coordinator_rig_with(hub, device_id, |store| store as Arc<dyn RecordStore<Entry>>)
}

/// Like [`coordinator_rig`], with the entry store wrapped by `entries`.
pub fn coordinator_rig_with<F>(hub: Arc<BroadcastHub>, device_id: &str, entries: F) -> Rig
where
    F: FnOnce(Arc<MemoryStore>) -> Arc<dyn RecordStore<Entry>>,
{
    let api = Arc::new(FakeSyncApi::new());
    let auth = Arc::new(TokenAuth::new("token"));
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let network = Arc::new(ManualNetworkMonitor::new(ConnectionQuality::Good, false));
    let battery = Arc::new(ManualBatteryMonitor::new(BatteryStatus::new(0.9, false)));
    let visibility = Arc::new(ManualVisibilityMonitor::new(false));
    let emitter = Arc::new(RecordingEmitter::new());

    let polling = Arc::new(PollingManager::new(
        network.clone(),
        battery,
        visibility,
        PollingSettings::default(),
    ));
    let queue = QueueSettings::default();
    let entry_queue = Arc::new(QueueProcessor::new(
        queue.retry_policy(),
        queue.batch_size,
        queue.drain_interval(),
        clock.clone(),
        Arc::new(FixedJitter::new(0.5)),
        Some(store.clone() as Arc<dyn QueueStore<Entry>>),
    ));
    let fault_queue = Arc::new(QueueProcessor::new(
        queue.retry_policy(),
        queue.batch_size,
        queue.drain_interval(),
        clock.clone(),
        Arc::new(FixedJitter::new(0.5)),
        Some(store.clone() as Arc<dyn QueueStore<FaultEntry>>),
    ));

    let coordinator = SyncCoordinator::new(CoordinatorParts {
        device_id: device_id.to_string(),
        device_name: format!("Timer {device_id}"),
        api: api.clone(),
        auth: auth.clone(),
        entries: entries(store.clone()),
        faults: store.clone(),
        cursors: store.clone(),
        clock: clock.clone(),
        network: network.clone(),
        polling,
        entry_queue,
        fault_queue,
        broadcast: Arc::new(BroadcastManager::new(hub, device_id, format!("Timer {device_id}"))),
        emitter: emitter.clone(),
        request_timeout: Duration::from_secs(5),
    });

    Rig {
        coordinator,
        api,
        auth,
        store,
        clock,
        network,
        emitter,
    }
}
