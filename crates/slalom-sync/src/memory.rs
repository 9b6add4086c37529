//! In-memory [`LocalStore`](slalom_core::LocalStore) for embedding without
//! SQLite, and for tests.

use async_trait::async_trait;
use slalom_core::{
    CursorStore, EpochMillis, Entry, FaultEntry, QueueStore, RecordKey, RecordKind, RecordStore,
    StoreResult, SyncQueueItem, SyncRecord,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

type Table<T> = Mutex<HashMap<String, Vec<T>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Table<Entry>,
    faults: Table<FaultEntry>,
    entry_queue: Table<SyncQueueItem<Entry>>,
    fault_queue: Table<SyncQueueItem<FaultEntry>>,
    cursors: Mutex<HashMap<(String, RecordKind), EpochMillis>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge<T: SyncRecord>(table: &Table<T>, race_id: &str, records: Vec<T>) -> Vec<T> {
    let mut table = lock(table);
    let stored = table.entry(race_id.to_string()).or_default();
    let mut inserted = Vec::new();
    for record in records {
        let key = record.key();
        if stored.iter().any(|existing| existing.key() == key) {
            continue;
        }
        stored.push(record.clone());
        inserted.push(record);
    }
    inserted
}

fn remove<T: SyncRecord>(table: &Table<T>, race_id: &str, ids: &[String]) -> usize {
    let mut table = lock(table);
    let Some(stored) = table.get_mut(race_id) else {
        return 0;
    };
    let before = stored.len();
    stored.retain(|record| !ids.iter().any(|id| id == record.id()));
    before - stored.len()
}

fn mark_synced<T: SyncRecord>(
    table: &Table<T>,
    race_id: &str,
    key: &RecordKey,
    at: EpochMillis,
) -> bool {
    let mut table = lock(table);
    let record = table
        .get_mut(race_id)
        .and_then(|stored| stored.iter_mut().find(|record| record.key() == *key));
    match record {
        Some(record) => {
            record.set_synced_at(at);
            true
        }
        None => false,
    }
}

fn list<T: Clone>(table: &Table<T>, race_id: &str) -> Vec<T> {
    lock(table).get(race_id).cloned().unwrap_or_default()
}

fn replace<T: Clone>(table: &Table<T>, race_id: &str, items: &[T]) {
    let mut table = lock(table);
    if items.is_empty() {
        table.remove(race_id);
    } else {
        table.insert(race_id.to_string(), items.to_vec());
    }
}

macro_rules! memory_record_store {
    ($record:ty, $records:ident, $queue:ident) => {
        #[async_trait]
        impl RecordStore<$record> for MemoryStore {
            async fn merge(
                &self,
                race_id: &str,
                records: Vec<$record>,
            ) -> StoreResult<Vec<$record>> {
                Ok(merge(&self.$records, race_id, records))
            }

            async fn remove(&self, race_id: &str, ids: &[String]) -> StoreResult<usize> {
                Ok(remove(&self.$records, race_id, ids))
            }

            async fn mark_synced(
                &self,
                race_id: &str,
                key: &RecordKey,
                at: EpochMillis,
            ) -> StoreResult<bool> {
                Ok(mark_synced(&self.$records, race_id, key, at))
            }

            async fn list(&self, race_id: &str) -> StoreResult<Vec<$record>> {
                Ok(list(&self.$records, race_id))
            }
        }

        #[async_trait]
        impl QueueStore<$record> for MemoryStore {
            async fn load_queue(&self, race_id: &str) -> StoreResult<Vec<SyncQueueItem<$record>>> {
                Ok(list(&self.$queue, race_id))
            }

            async fn save_queue(
                &self,
                race_id: &str,
                items: &[SyncQueueItem<$record>],
            ) -> StoreResult<()> {
                replace(&self.$queue, race_id, items);
                Ok(())
            }
        }
    };
}

memory_record_store!(Entry, entries, entry_queue);
memory_record_store!(FaultEntry, faults, fault_queue);

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, race_id: &str, kind: RecordKind) -> StoreResult<EpochMillis> {
        Ok(lock(&self.cursors)
            .get(&(race_id.to_string(), kind))
            .copied()
            .unwrap_or(0))
    }

    async fn save_cursor(
        &self,
        race_id: &str,
        kind: RecordKind,
        cursor: EpochMillis,
    ) -> StoreResult<()> {
        lock(&self.cursors).insert((race_id.to_string(), kind), cursor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entry, fault};
    use slalom_core::LocalStore;

    fn assert_local_store<S: LocalStore>() {}

    #[test]
    fn test_is_local_store() {
        assert_local_store::<MemoryStore>();
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = MemoryStore::new();
        let both = vec![entry("e1", "dev-a"), entry("e1", "dev-b")];
        let first = RecordStore::<Entry>::merge(&store, "r1", both).await.unwrap();
        assert_eq!(first.len(), 2);

        let again = RecordStore::<Entry>::merge(&store, "r1", vec![entry("e1", "dev-a")])
            .await
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(RecordStore::<Entry>::list(&store, "r1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_by_id_across_devices() {
        let store = MemoryStore::new();
        let faults = vec![fault("f1", "dev-a"), fault("f1", "dev-b"), fault("f2", "dev-a")];
        RecordStore::<FaultEntry>::merge(&store, "r1", faults).await.unwrap();
        let removed = RecordStore::<FaultEntry>::remove(&store, "r1", &["f1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(RecordStore::<FaultEntry>::list(&store, "r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_defaults_to_zero_per_kind() {
        let store = MemoryStore::new();
        store.save_cursor("r1", RecordKind::Entry, 99).await.unwrap();
        assert_eq!(store.load_cursor("r1", RecordKind::Entry).await.unwrap(), 99);
        assert_eq!(store.load_cursor("r1", RecordKind::Fault).await.unwrap(), 0);
    }
}
