//! # Sync Engine
//!
//! Assembles the polling timer, both send queues, the broadcast channel and
//! the coordinator from a [`SyncConfig`] and a local store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncEngineBuilder::new(config)                                         │
//! │      .with_store(store)        required                                 │
//! │      .with_auth(auth)          default: NoAuth                          │
//! │      .with_api(api)            default: HttpSyncApi(config.cloud)       │
//! │      .with_monitors(n, b, v)   default: Manual*, online and visible     │
//! │      .with_emitter(emitter)    default: NoOpEmitter                     │
//! │      .build()?                                                          │
//! │                                                                         │
//! │  engine.start("race-1") ─► coordinator.initialize + immediate poll     │
//! │  engine.stop()          ─► coordinator.cleanup                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use slalom_core::{
    ConnectionQuality, ConnectionStatus, Entry, FaultEntry, LocalStore, PollingTier, QueueStore,
    RecordKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::SyncApi;
use crate::auth::{AuthProvider, NoAuth};
use crate::broadcast::{BroadcastHub, BroadcastManager};
use crate::clock::{Clock, Jitter, RandomJitter, SystemClock};
use crate::config::SyncConfig;
use crate::coordinator::{CoordinatorParts, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::event::{NoOpEmitter, SyncEventEmitter};
use crate::http::HttpSyncApi;
use crate::monitor::{
    BatteryMonitor, ManualBatteryMonitor, ManualNetworkMonitor, ManualVisibilityMonitor,
    NetworkMonitor, VisibilityMonitor,
};
use crate::polling::PollingManager;
use crate::queue::QueueProcessor;

// =============================================================================
// Engine Status
// =============================================================================

/// Snapshot of the engine for external queries.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub connection: ConnectionStatus,
    pub race_id: Option<String>,
    pub pending_entries: usize,
    pub pending_faults: usize,
    pub polling_tier: PollingTier,
    pub polling_interval: Duration,
    pub entry_cursor: i64,
    pub fault_cursor: i64,
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    config: Arc<SyncConfig>,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncEngine {
    /// Binds to `race_id` and polls right away.
    pub async fn start(&self, race_id: &str) -> SyncResult<()> {
        self.coordinator.initialize(race_id).await?;
        self.coordinator.refresh();
        info!(race_id = %race_id, device_id = %self.config.device_id(), "Sync engine started");
        Ok(())
    }

    /// Stops syncing the current race. Queued records stay persisted.
    pub async fn stop(&self) {
        self.coordinator.cleanup().await;
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        info!("Sync engine shut down");
    }

    pub fn status(&self) -> EngineStatus {
        let polling = self.coordinator.polling();
        EngineStatus {
            connection: self.coordinator.status(),
            race_id: self.coordinator.race_id(),
            pending_entries: self.coordinator.entry_queue().queue_length(),
            pending_faults: self.coordinator.fault_queue().queue_length(),
            polling_tier: polling.tier(),
            polling_interval: polling.current_interval(),
            entry_cursor: self.coordinator.cursor(RecordKind::Entry),
            fault_cursor: self.coordinator.cursor(RecordKind::Fault),
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

struct StoreHandles {
    entries: Arc<dyn slalom_core::RecordStore<Entry>>,
    faults: Arc<dyn slalom_core::RecordStore<FaultEntry>>,
    entry_queue: Arc<dyn QueueStore<Entry>>,
    fault_queue: Arc<dyn QueueStore<FaultEntry>>,
    cursors: Arc<dyn slalom_core::CursorStore>,
}

/// Builder for creating a [`SyncEngine`] with options.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Option<StoreHandles>,
    api: Option<Arc<dyn SyncApi>>,
    auth: Option<Arc<dyn AuthProvider>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    battery: Option<Arc<dyn BatteryMonitor>>,
    visibility: Option<Arc<dyn VisibilityMonitor>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    clock: Option<Arc<dyn Clock>>,
    jitter: Option<Arc<dyn Jitter>>,
    hub: Option<Arc<BroadcastHub>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncEngineBuilder {
            config,
            store: None,
            api: None,
            auth: None,
            network: None,
            battery: None,
            visibility: None,
            emitter: None,
            clock: None,
            jitter: None,
            hub: None,
        }
    }

    /// Sets the local store (SQLite or in-memory).
    pub fn with_store<S: LocalStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(StoreHandles {
            entries: store.clone(),
            faults: store.clone(),
            entry_queue: store.clone(),
            fault_queue: store.clone(),
            cursors: store,
        });
        self
    }

    pub fn with_api(mut self, api: Arc<dyn SyncApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_monitors(
        mut self,
        network: Arc<dyn NetworkMonitor>,
        battery: Arc<dyn BatteryMonitor>,
        visibility: Arc<dyn VisibilityMonitor>,
    ) -> Self {
        self.network = Some(network);
        self.battery = Some(battery);
        self.visibility = Some(visibility);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Shares a broadcast hub with other sessions in the process.
    pub fn with_hub(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Local store required".into()))?;

        let auth = self.auth.unwrap_or_else(|| Arc::new(NoAuth));
        let api = match self.api {
            Some(api) => api,
            None => Arc::new(HttpSyncApi::new(&self.config.cloud, Arc::clone(&auth))?),
        };
        let network = self
            .network
            .unwrap_or_else(|| Arc::new(ManualNetworkMonitor::new(ConnectionQuality::Good, false)));
        let battery = self.battery.unwrap_or_else(|| Arc::new(ManualBatteryMonitor::default()));
        let visibility = self
            .visibility
            .unwrap_or_else(|| Arc::new(ManualVisibilityMonitor::new(false)));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let jitter = self.jitter.unwrap_or_else(|| Arc::new(RandomJitter));
        let hub = self.hub.unwrap_or_else(|| Arc::new(BroadcastHub::new()));

        let config = Arc::new(self.config);
        let queue = &config.queue;

        let polling = Arc::new(PollingManager::new(
            Arc::clone(&network),
            battery,
            visibility,
            config.polling.clone(),
        ));
        let entry_queue = Arc::new(QueueProcessor::new(
            queue.retry_policy(),
            queue.batch_size,
            queue.drain_interval(),
            Arc::clone(&clock),
            Arc::clone(&jitter),
            Some(store.entry_queue),
        ));
        let fault_queue = Arc::new(QueueProcessor::new(
            queue.retry_policy(),
            queue.batch_size,
            queue.drain_interval(),
            Arc::clone(&clock),
            jitter,
            Some(store.fault_queue),
        ));
        let broadcast = Arc::new(
            BroadcastManager::new(hub, config.device_id(), config.device_name()),
        );

        let coordinator = SyncCoordinator::new(CoordinatorParts {
            device_id: config.device_id().to_string(),
            device_name: config.device_name().to_string(),
            api,
            auth,
            entries: store.entries,
            faults: store.faults,
            cursors: store.cursors,
            clock,
            network,
            polling,
            entry_queue,
            fault_queue,
            broadcast,
            emitter,
            request_timeout: config.request_timeout(),
        });

        Ok(SyncEngine { config, coordinator })
    }
}
