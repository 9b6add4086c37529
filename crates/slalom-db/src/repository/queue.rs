//! # Send Queue Repository
//!
//! Persists the pending-send queue of a race. The queue is small (bounded by
//! retries and eviction) so every save rewrites it in one transaction.

use slalom_core::{RecordKind, SyncQueueItem, SyncRecord};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

/// Repository for persisted `SyncQueueItem`s.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    /// Loads the queue of a race in its saved order.
    ///
    /// Items that no longer decode are dropped with a warning.
    pub async fn load<T: SyncRecord>(&self, race_id: &str) -> DbResult<Vec<SyncQueueItem<T>>> {
        let rows = sqlx::query(
            "SELECT position, payload FROM sync_queue
             WHERE kind = ?1 AND race_id = ?2
             ORDER BY position ASC",
        )
        .bind(T::KIND.as_str())
        .bind(race_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            match serde_json::from_str::<SyncQueueItem<T>>(&payload) {
                Ok(item) => items.push(item),
                Err(e) => {
                    let position: i64 = row.try_get("position")?;
                    warn!(
                        race_id = %race_id,
                        position,
                        error = %e,
                        "Dropping undecodable queue item"
                    );
                }
            }
        }
        Ok(items)
    }

    /// Replaces the persisted queue of a race.
    pub async fn save<T: SyncRecord>(
        &self,
        race_id: &str,
        items: &[SyncQueueItem<T>],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sync_queue WHERE kind = ?1 AND race_id = ?2")
            .bind(T::KIND.as_str())
            .bind(race_id)
            .execute(&mut *tx)
            .await?;

        for (position, item) in items.iter().enumerate() {
            let payload = serde_json::to_string(item)
                .map_err(|e| DbError::payload(item.key().to_string(), e))?;
            sqlx::query(
                "INSERT INTO sync_queue (kind, race_id, position, payload) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(T::KIND.as_str())
            .bind(race_id)
            .bind(position as i64)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(kind = %T::KIND, race_id = %race_id, items = items.len(), "Saved send queue");
        Ok(())
    }

    /// Number of persisted items for a race.
    pub async fn count(&self, kind: RecordKind, race_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_queue WHERE kind = ?1 AND race_id = ?2",
        )
        .bind(kind.as_str())
        .bind(race_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};
    use chrono::Utc;
    use slalom_core::{Entry, EntryStatus, RecordKind, SyncQueueItem, TimingPoint};

    fn item(id: &str, retry_count: u32) -> SyncQueueItem<Entry> {
        let mut item = SyncQueueItem::new(
            Entry {
                id: id.into(),
                bib: "1".into(),
                point: TimingPoint::Start,
                run: 1,
                timestamp: Utc::now(),
                status: EntryStatus::Ok,
                device_id: "dev".into(),
                device_name: "Start".into(),
                photo: None,
                synced_at: None,
            },
            1_000,
        );
        for _ in 0..retry_count {
            item.record_failure(2_000, "HTTP 500");
        }
        item
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_order_and_retries() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.queue();

        repo.save("race-1", &[item("a", 0), item("b", 3)]).await.unwrap();
        let loaded = repo.load::<Entry>("race-1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].entry.id, "a");
        assert_eq!(loaded[1].retry_count, 3);
        assert_eq!(loaded[1].error.as_deref(), Some("HTTP 500"));

        repo.save::<Entry>("race-1", &[item("b", 3)]).await.unwrap();
        assert_eq!(repo.count(RecordKind::Entry, "race-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queues_are_race_scoped() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.queue();

        repo.save("race-1", &[item("a", 0)]).await.unwrap();
        assert!(repo.load::<Entry>("race-2").await.unwrap().is_empty());
    }
}
