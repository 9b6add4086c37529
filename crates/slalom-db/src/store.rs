//! Storage trait implementations backed by SQLite.

use async_trait::async_trait;
use slalom_core::{
    CursorStore, EpochMillis, QueueStore, RecordKey, RecordKind, RecordStore, StoreResult,
    SyncQueueItem, SyncRecord,
};

use crate::pool::Database;

#[async_trait]
impl<T: SyncRecord> RecordStore<T> for Database {
    async fn merge(&self, race_id: &str, records: Vec<T>) -> StoreResult<Vec<T>> {
        Ok(self.records().merge(race_id, records).await?)
    }

    async fn remove(&self, race_id: &str, ids: &[String]) -> StoreResult<usize> {
        Ok(self.records().remove(T::KIND, race_id, ids).await?)
    }

    async fn mark_synced(
        &self,
        race_id: &str,
        key: &RecordKey,
        at: EpochMillis,
    ) -> StoreResult<bool> {
        Ok(self.records().mark_synced::<T>(race_id, key, at).await?)
    }

    async fn list(&self, race_id: &str) -> StoreResult<Vec<T>> {
        Ok(self.records().list(race_id).await?)
    }
}

#[async_trait]
impl<T: SyncRecord> QueueStore<T> for Database {
    async fn load_queue(&self, race_id: &str) -> StoreResult<Vec<SyncQueueItem<T>>> {
        Ok(self.queue().load(race_id).await?)
    }

    async fn save_queue(&self, race_id: &str, items: &[SyncQueueItem<T>]) -> StoreResult<()> {
        Ok(self.queue().save(race_id, items).await?)
    }
}

#[async_trait]
impl CursorStore for Database {
    async fn load_cursor(&self, race_id: &str, kind: RecordKind) -> StoreResult<EpochMillis> {
        Ok(self.cursors().load(race_id, kind).await?)
    }

    async fn save_cursor(
        &self,
        race_id: &str,
        kind: RecordKind,
        cursor: EpochMillis,
    ) -> StoreResult<()> {
        Ok(self.cursors().save(race_id, kind, cursor).await?)
    }
}
