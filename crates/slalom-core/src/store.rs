//! # Storage Collaborator Traits
//!
//! The sync engine never touches persistence directly. It goes through these
//! traits, implemented by `slalom-db` (SQLite) and by an in-memory store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  RecordStore<T>   merge / remove / mark_synced / list   (per race)      │
//! │  QueueStore<T>    load_queue / save_queue               (per race)      │
//! │  CursorStore      load_cursor / save_cursor             (per race+kind) │
//! │                                                                         │
//! │  LocalStore = all of the above for Entry and FaultEntry                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{
    EpochMillis, Entry, FaultEntry, RecordKey, RecordKind, SyncQueueItem, SyncRecord,
};

/// Local record storage for one record family.
#[async_trait]
pub trait RecordStore<T: SyncRecord>: Send + Sync {
    /// Inserts records whose key is not present yet.
    ///
    /// Returns only the newly inserted records. Merging an already present
    /// key is a no-op.
    async fn merge(&self, race_id: &str, records: Vec<T>) -> StoreResult<Vec<T>>;

    /// Removes every record whose id is listed, regardless of device.
    async fn remove(&self, race_id: &str, ids: &[String]) -> StoreResult<usize>;

    /// Sets `syncedAt` on a stored record. Returns false if it is unknown.
    async fn mark_synced(
        &self,
        race_id: &str,
        key: &RecordKey,
        at: EpochMillis,
    ) -> StoreResult<bool>;

    async fn list(&self, race_id: &str) -> StoreResult<Vec<T>>;
}

/// Persistence of the pending-send queue.
#[async_trait]
pub trait QueueStore<T: SyncRecord>: Send + Sync {
    async fn load_queue(&self, race_id: &str) -> StoreResult<Vec<SyncQueueItem<T>>>;

    /// Replaces the whole persisted queue for a race.
    async fn save_queue(&self, race_id: &str, items: &[SyncQueueItem<T>]) -> StoreResult<()>;
}

/// Persistence of delta-sync watermarks.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Returns 0 when no cursor was saved.
    async fn load_cursor(&self, race_id: &str, kind: RecordKind) -> StoreResult<EpochMillis>;

    async fn save_cursor(
        &self,
        race_id: &str,
        kind: RecordKind,
        cursor: EpochMillis,
    ) -> StoreResult<()>;
}

/// Everything the sync engine needs from local persistence.
pub trait LocalStore:
    RecordStore<Entry>
    + RecordStore<FaultEntry>
    + QueueStore<Entry>
    + QueueStore<FaultEntry>
    + CursorStore
{
}

impl<S> LocalStore for S where
    S: RecordStore<Entry>
        + RecordStore<FaultEntry>
        + QueueStore<Entry>
        + QueueStore<FaultEntry>
        + CursorStore
{
}
