//! # slalom-sync: Adaptive Offline-First Sync Engine
//!
//! Keeps timing entries and gate faults of one race consistent across the
//! devices of a race crew, with the cloud as the meeting point and local
//! storage as the source of truth while offline.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Engine Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncCoordinator (Main Orchestrator)              │  │
//! │  │                                                                  │  │
//! │  │  Binds to one race at a time                                     │  │
//! │  │  Fetch/merge, send, tombstones, connection status                │  │
//! │  └───────┬───────────────────┬────────────────────┬─────────────────┘  │
//! │          ▼                   ▼                    ▼                     │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ PollingManager │  │ QueueProcessor │  │  BroadcastManager      │    │
//! │  │                │  │  (entries and  │  │                        │    │
//! │  │ Tiered adaptive│  │   faults)      │  │ Sibling tabs of the    │    │
//! │  │ check timer    │  │ Backoff, batch │  │ same device            │    │
//! │  └───────┬────────┘  └────────────────┘  └────────────────────────┘    │
//! │          │                                                              │
//! │  ┌───────┴─────────────────────────┐  ┌────────────────────────────┐   │
//! │  │ Network / Battery / Visibility  │  │ SyncApi (HttpSyncApi)      │   │
//! │  │ monitors                        │  │ AuthProvider (TokenAuth)   │   │
//! │  └─────────────────────────────────┘  └────────────────────────────┘   │
//! │                                                                         │
//! │  EVENTS (to the embedding app): SyncEvent via SyncEventEmitter         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`engine`] - `SyncEngine` facade and builder
//! - [`coordinator`] - Fetch, merge and send orchestration
//! - [`polling`] - Adaptive polling timer
//! - [`queue`] - Retry queue with jittered backoff
//! - [`broadcast`] - Cross-tab fan-out
//!
//! ### Collaborators
//! - [`api`] - Wire types and the `SyncApi` seam
//! - [`http`] - `SyncApi` over HTTP
//! - [`auth`] - Bearer token providers
//! - [`monitor`] - Network, battery and visibility signals
//! - [`memory`] - In-memory local store
//! - [`clock`] - Wall clock and jitter sources
//!
//! ### Plumbing
//! - [`config`] - Device, cloud, queue and polling settings
//! - [`error`] - Sync error types and classes
//! - [`event`] - Events reported to the app
//! - [`operation`] - Race-scoped cancellation and deadlines
//! - [`status`] - Connection status state machine
//! - [`signal`] - Subscribe/dispose registry
//! - [`guard`] - Non-blocking reentrancy guard
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slalom_sync::{SyncConfig, SyncEngineBuilder};
//! use slalom_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let db = Arc::new(Database::new(DbConfig::new(db_path)).await?);
//!
//! let engine = SyncEngineBuilder::new(config).with_store(db).build()?;
//! engine.start("race-2026-01").await?;
//!
//! let outcome = engine.coordinator().submit_entry(entry).await?;
//! println!("{:?} ({} pending)", outcome, engine.status().pending_entries);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event;
pub mod guard;
pub mod http;
pub mod memory;
pub mod monitor;
pub mod operation;
pub mod polling;
pub mod queue;
pub mod signal;
pub mod status;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::SyncApi;
pub use auth::{AuthProvider, NoAuth, TokenAuth, TokenInfo};
pub use broadcast::{BroadcastHub, BroadcastManager};
pub use clock::{Clock, Jitter, SystemClock};
pub use config::{CloudSettings, DeviceConfig, PollingSettings, QueueSettings, SyncConfig};
pub use coordinator::{FetchSummary, SubmitOutcome, SyncCoordinator};
pub use engine::{EngineStatus, SyncEngine, SyncEngineBuilder};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use event::{NoOpEmitter, SyncEvent, SyncEventEmitter};
pub use http::HttpSyncApi;
pub use memory::MemoryStore;
pub use monitor::{
    BatteryMonitor, ManualBatteryMonitor, ManualNetworkMonitor, ManualVisibilityMonitor,
    NetworkMonitor, VisibilityMonitor,
};
pub use polling::PollingManager;
pub use queue::{DrainReport, QueueProcessor};
