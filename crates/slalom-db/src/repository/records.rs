//! # Record Repository
//!
//! Entries and faults, stored as JSON payloads keyed by
//! `(kind, race_id, id, device_id)`.
//!
//! ```text
//! merge(race, [r1, r2, r1'])
//!     │
//!     ▼
//! INSERT OR IGNORE per record  ── rows_affected = 1 → newly inserted
//!                              └─ rows_affected = 0 → already present, no-op
//! ```

use slalom_core::{EpochMillis, RecordKey, RecordKind, SyncRecord};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

/// Repository for entry and fault records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Inserts records whose key is not stored yet and returns them.
    pub async fn merge<T: SyncRecord>(&self, race_id: &str, records: Vec<T>) -> DbResult<Vec<T>> {
        let mut inserted = Vec::new();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let payload = serde_json::to_string(&record)
                .map_err(|e| DbError::payload(record.key().to_string(), e))?;

            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO records (
                    kind, race_id, id, device_id, payload, synced_at, created_seq
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6,
                    (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM records)
                )
                "#,
            )
            .bind(T::KIND.as_str())
            .bind(race_id)
            .bind(record.id())
            .bind(record.device_id())
            .bind(&payload)
            .bind(record.synced_at())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                inserted.push(record);
            }
        }

        tx.commit().await?;

        debug!(
            kind = %T::KIND,
            race_id = %race_id,
            inserted = inserted.len(),
            "Merged records"
        );
        Ok(inserted)
    }

    /// Removes every record of `kind` whose id is listed.
    pub async fn remove(&self, kind: RecordKind, race_id: &str, ids: &[String]) -> DbResult<usize> {
        let mut removed = 0u64;
        let mut tx = self.pool.begin().await?;

        for id in ids {
            let result = sqlx::query(
                "DELETE FROM records WHERE kind = ?1 AND race_id = ?2 AND id = ?3",
            )
            .bind(kind.as_str())
            .bind(race_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }

        tx.commit().await?;
        Ok(removed as usize)
    }

    /// Sets `syncedAt` on both the column and the JSON payload.
    pub async fn mark_synced<T: SyncRecord>(
        &self,
        race_id: &str,
        key: &RecordKey,
        at: EpochMillis,
    ) -> DbResult<bool> {
        let row = sqlx::query(
            "SELECT payload FROM records
             WHERE kind = ?1 AND race_id = ?2 AND id = ?3 AND device_id = ?4",
        )
        .bind(T::KIND.as_str())
        .bind(race_id)
        .bind(&key.id)
        .bind(&key.device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let payload: String = row.try_get("payload")?;
        let mut record: T =
            serde_json::from_str(&payload).map_err(|e| DbError::payload(key.to_string(), e))?;
        record.set_synced_at(at);
        let payload =
            serde_json::to_string(&record).map_err(|e| DbError::payload(key.to_string(), e))?;

        sqlx::query(
            r#"
            UPDATE records SET payload = ?5, synced_at = ?6
            WHERE kind = ?1 AND race_id = ?2 AND id = ?3 AND device_id = ?4
            "#,
        )
        .bind(T::KIND.as_str())
        .bind(race_id)
        .bind(&key.id)
        .bind(&key.device_id)
        .bind(&payload)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Lists records of a race in insertion order. Undecodable rows are
    /// skipped.
    pub async fn list<T: SyncRecord>(&self, race_id: &str) -> DbResult<Vec<T>> {
        let rows = sqlx::query(
            "SELECT id, device_id, payload FROM records
             WHERE kind = ?1 AND race_id = ?2
             ORDER BY created_seq ASC",
        )
        .bind(T::KIND.as_str())
        .bind(race_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            match serde_json::from_str::<T>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let id: String = row.try_get("id")?;
                    let device_id: String = row.try_get("device_id")?;
                    warn!(
                        id = %id,
                        device_id = %device_id,
                        error = %e,
                        "Skipping undecodable record"
                    );
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};
    use chrono::Utc;
    use slalom_core::{
        Entry, EntryStatus, FaultEntry, FaultType, RecordKey, SyncRecord, TimingPoint,
    };

    fn entry(id: &str, device: &str) -> Entry {
        Entry {
            id: id.into(),
            bib: "5".into(),
            point: TimingPoint::Finish,
            run: 1,
            timestamp: Utc::now(),
            status: EntryStatus::Ok,
            device_id: device.into(),
            device_name: "Finish".into(),
            photo: None,
            synced_at: None,
        }
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.records();

        let first = repo
            .merge("race-1", vec![entry("1", "a"), entry("2", "a")])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let again = repo
            .merge("race-1", vec![entry("1", "a"), entry("2", "a"), entry("1", "b")])
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].key(), RecordKey::new("1", "b"));

        let all: Vec<Entry> = repo.list("race-1").await.unwrap();
        assert_eq!(all.len(), 3);
        let other: Vec<Entry> = repo.list("race-2").await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_id_across_devices() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.records();
        repo.merge("r", vec![entry("1", "a"), entry("1", "b"), entry("2", "a")])
            .await
            .unwrap();

        let removed = repo
            .remove(slalom_core::RecordKind::Entry, "r", &["1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<Entry> = repo.list("r").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_synced_updates_payload() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.records();
        repo.merge("r", vec![entry("1", "a")]).await.unwrap();

        assert!(repo.mark_synced::<Entry>("r", &RecordKey::new("1", "a"), 99).await.unwrap());
        assert!(!repo.mark_synced::<Entry>("r", &RecordKey::new("9", "a"), 99).await.unwrap());

        let all: Vec<Entry> = repo.list("r").await.unwrap();
        assert_eq!(all[0].synced_at, Some(99));
    }

    #[tokio::test]
    async fn test_kinds_are_separate() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.records();
        repo.merge("r", vec![entry("1", "a")]).await.unwrap();

        let fault = FaultEntry {
            id: "1".into(),
            bib: "5".into(),
            run: 1,
            gate_number: 3,
            fault_type: FaultType::Straddling,
            timestamp: Utc::now(),
            device_id: "a".into(),
            device_name: "Judge".into(),
            gate_range: None,
            synced_at: None,
        };
        let inserted = repo.merge("r", vec![fault]).await.unwrap();
        assert_eq!(inserted.len(), 1);

        let faults: Vec<FaultEntry> = repo.list("r").await.unwrap();
        assert_eq!(faults.len(), 1);
    }
}
