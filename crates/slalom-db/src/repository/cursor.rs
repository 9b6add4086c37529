//! Delta-sync cursor storage, one row per `(kind, race_id)`.

use slalom_core::{EpochMillis, RecordKind};
use sqlx::SqlitePool;

use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct CursorRepository {
    pool: SqlitePool,
}

impl CursorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CursorRepository { pool }
    }

    /// Returns the saved watermark or 0.
    pub async fn load(&self, race_id: &str, kind: RecordKind) -> DbResult<EpochMillis> {
        let cursor: Option<i64> =
            sqlx::query_scalar(
                "SELECT last_sync FROM sync_cursors WHERE kind = ?1 AND race_id = ?2",
            )
            .bind(kind.as_str())
            .bind(race_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(cursor.unwrap_or(0))
    }

    pub async fn save(&self, race_id: &str, kind: RecordKind, cursor: EpochMillis) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (kind, race_id, last_sync) VALUES (?1, ?2, ?3)
            ON CONFLICT (kind, race_id) DO UPDATE SET last_sync = excluded.last_sync
            "#,
        )
        .bind(kind.as_str())
        .bind(race_id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};
    use slalom_core::RecordKind;

    #[tokio::test]
    async fn test_cursor_upsert() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.cursors();

        assert_eq!(repo.load("r", RecordKind::Entry).await.unwrap(), 0);
        repo.save("r", RecordKind::Entry, 1_000).await.unwrap();
        repo.save("r", RecordKind::Entry, 2_000).await.unwrap();
        assert_eq!(repo.load("r", RecordKind::Entry).await.unwrap(), 2_000);
        assert_eq!(repo.load("r", RecordKind::Fault).await.unwrap(), 0);
    }
}
