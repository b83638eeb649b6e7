//! Database schema definitions.

use sqlx::SqlitePool;

use crate::storage::StorageError;

/// SQL statement for creating the buffer_entries table.
///
/// `id` is AUTOINCREMENT so purged ids are never handed out again.
/// Timestamps are stored as epoch milliseconds, metrics as a JSON object.
pub const BUFFER_ENTRIES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS buffer_entries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    ts            INTEGER NOT NULL,
    latitude      REAL,
    longitude     REAL,
    metrics       TEXT NOT NULL DEFAULT '{}',
    state         TEXT NOT NULL CHECK (state IN ('pending', 'in_flight', 'acknowledged')),
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt  INTEGER,
    outcome       TEXT CHECK (outcome IS NULL OR outcome IN ('delivered', 'rejected', 'abandoned')),
    acked_at      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_buffer_entries_state_ts ON buffer_entries (state, ts, id);
"#;

/// SQL statement for creating the events table.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ts        INTEGER NOT NULL,
    source    TEXT NOT NULL,
    kind      TEXT NOT NULL,
    severity  TEXT NOT NULL,
    message   TEXT NOT NULL,
    payload   TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts);
"#;

/// Initialize the database schema.
///
/// Creates all necessary tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::raw_sql(BUFFER_ENTRIES_TABLE_DDL).execute(pool).await?;
    sqlx::raw_sql(EVENTS_TABLE_DDL).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::SqlitePool as Pool;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        init_schema(pool.inner()).await.unwrap();
        init_schema(pool.inner()).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('buffer_entries', 'events') ORDER BY name",
        )
        .fetch_all(pool.inner())
        .await
        .unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].0, "buffer_entries");
        assert_eq!(tables[1].0, "events");
    }

    #[tokio::test]
    async fn test_state_check_constraint() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        init_schema(pool.inner()).await.unwrap();

        let result = sqlx::query("INSERT INTO buffer_entries (ts, state) VALUES (0, 'sent')")
            .execute(pool.inner())
            .await;
        assert!(result.is_err(), "unknown state must be rejected");
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_delete() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        init_schema(pool.inner()).await.unwrap();

        let insert = "INSERT INTO buffer_entries (ts, state) VALUES (0, 'pending') RETURNING id";
        let (first,): (i64,) = sqlx::query_as(insert).fetch_one(pool.inner()).await.unwrap();
        sqlx::query("DELETE FROM buffer_entries")
            .execute(pool.inner())
            .await
            .unwrap();
        let (second,): (i64,) = sqlx::query_as(insert).fetch_one(pool.inner()).await.unwrap();

        assert!(second > first);
    }
}
