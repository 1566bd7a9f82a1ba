//! SQLite storage — one row per session.
//!
//! Uses a single database file with a `sessions` table keyed by session id.
//! Records are replaced with an upsert inside SQLite's own transaction, so a
//! write either lands completely or not at all.

use async_trait::async_trait;
use chrono::Utc;
use cortex_core::SessionStorage;
use cortex_core::error::MemoryError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `":memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        // a single connection keeps `:memory:` databases shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open SQLite: {e}")))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        info!("SQLite session storage initialized at {path}");
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id  TEXT PRIMARY KEY NOT NULL,
                record      TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::MigrationFailed(format!("sessions table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn read(&self, session_id: &str) -> Result<Option<String>, MemoryError> {
        let row = sqlx::query("SELECT record FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to read session: {e}")))?;
        row.map(|r| r.try_get::<String, _>("record"))
            .transpose()
            .map_err(|e| MemoryError::Storage(format!("Failed to decode session row: {e}")))
    }

    async fn write(&self, session_id: &str, record: &str) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, record, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(record)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("Failed to write session: {e}")))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, MemoryError> {
        let rows = sqlx::query("SELECT session_id FROM sessions ORDER BY session_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to list sessions: {e}")))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("session_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MemoryError::Storage(format!("Failed to decode session row: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_record() {
        let storage = SqliteStorage::new(":memory:").await.unwrap();
        assert_eq!(storage.read("chat-1").await.unwrap(), None);

        storage.write("chat-1", "v1").await.unwrap();
        storage.write("chat-1", "v2").await.unwrap();
        storage.write("chat-2", "other").await.unwrap();

        assert_eq!(storage.read("chat-1").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(storage.list().await.unwrap(), vec!["chat-1", "chat-2"]);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let path = path.to_str().unwrap();
        {
            let storage = SqliteStorage::new(path).await.unwrap();
            storage.write("chat-1", "kept").await.unwrap();
            storage.pool.close().await;
        }
        let storage = SqliteStorage::new(path).await.unwrap();
        assert_eq!(storage.read("chat-1").await.unwrap().as_deref(), Some("kept"));
    }
}
