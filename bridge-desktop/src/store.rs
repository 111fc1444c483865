//! Snapshot Storage using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SnapshotStore,
    ChatId, UserId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::PathBuf;
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS session_snapshots (
        chat_id INTEGER PRIMARY KEY,
        snapshot TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS banned_users (
        user_id INTEGER PRIMARY KEY
    )
    "#,
];

/// SQLite-backed [`SnapshotStore`].
///
/// One row per chat holds the serialized session snapshot; the ban list is
/// a single-column table rewritten on every save.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

fn db_error(context: &str, e: sqlx::Error) -> BridgeError {
    BridgeError::DatabaseError(format!("{}: {}", context, e))
}

impl SqliteSnapshotStore {
    /// Open (or create) the database file at `db_path`.
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(BridgeError::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to connect to DB", e))?;

        Self::migrate(&pool).await?;
        debug!(path = ?db_path, "Initialized snapshot store");

        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps the database alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("Failed to connect to DB", e))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| db_error("Failed to create table", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save_session_snapshot(&self, chat_id: ChatId, snapshot: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_snapshots (chat_id, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(chat_id.value())
        .bind(snapshot)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save snapshot", e))?;

        debug!(chat_id = %chat_id, bytes = snapshot.len(), "Stored session snapshot");
        Ok(())
    }

    async fn load_session_snapshot(&self, chat_id: ChatId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT snapshot FROM session_snapshots WHERE chat_id = ?")
            .bind(chat_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load snapshot", e))?;

        Ok(row.map(|row| row.get(0)))
    }

    async fn delete_session_snapshot(&self, chat_id: ChatId) -> Result<()> {
        sqlx::query("DELETE FROM session_snapshots WHERE chat_id = ?")
            .bind(chat_id.value())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete snapshot", e))?;

        debug!(chat_id = %chat_id, "Deleted session snapshot");
        Ok(())
    }

    async fn list_session_snapshots(&self) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT chat_id FROM session_snapshots ORDER BY chat_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list snapshots", e))?;

        Ok(rows
            .into_iter()
            .map(|row| ChatId::new(row.get(0)))
            .collect())
    }

    async fn save_banned_users(&self, users: &[UserId]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query("DELETE FROM banned_users")
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to clear ban list", e))?;

        for user in users {
            sqlx::query("INSERT OR IGNORE INTO banned_users (user_id) VALUES (?)")
                .bind(user.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to save ban list", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit", e))?;

        debug!(count = users.len(), "Stored ban list");
        Ok(())
    }

    async fn load_banned_users(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM banned_users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load ban list", e))?;

        Ok(rows.into_iter().map(|row| UserId::new(row.get(0))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_upsert_and_delete() {
        let store = SqliteSnapshotStore::in_memory().await.unwrap();
        let chat = ChatId::new(-100);

        assert_eq!(store.load_session_snapshot(chat).await.unwrap(), None);

        store.save_session_snapshot(chat, "{\"v\":1}").await.unwrap();
        store.save_session_snapshot(chat, "{\"v\":2}").await.unwrap();
        assert_eq!(
            store.load_session_snapshot(chat).await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );

        store.delete_session_snapshot(chat).await.unwrap();
        assert_eq!(store.load_session_snapshot(chat).await.unwrap(), None);

        // Deleting twice is fine.
        store.delete_session_snapshot(chat).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_snapshots_sorted() {
        let store = SqliteSnapshotStore::in_memory().await.unwrap();
        store.save_session_snapshot(ChatId::new(5), "{}").await.unwrap();
        store.save_session_snapshot(ChatId::new(-7), "{}").await.unwrap();

        let chats = store.list_session_snapshots().await.unwrap();
        assert_eq!(chats, vec![ChatId::new(-7), ChatId::new(5)]);
    }

    #[tokio::test]
    async fn test_ban_list_is_replaced_on_save() {
        let store = SqliteSnapshotStore::in_memory().await.unwrap();
        assert!(store.load_banned_users().await.unwrap().is_empty());

        store
            .save_banned_users(&[UserId::new(3), UserId::new(1)])
            .await
            .unwrap();
        assert_eq!(
            store.load_banned_users().await.unwrap(),
            vec![UserId::new(1), UserId::new(3)]
        );

        store.save_banned_users(&[UserId::new(2)]).await.unwrap();
        assert_eq!(store.load_banned_users().await.unwrap(), vec![UserId::new(2)]);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("voicecast.db");

        let store = SqliteSnapshotStore::new(path.clone()).await.unwrap();
        store.save_session_snapshot(ChatId::new(1), "{}").await.unwrap();
        drop(store);

        let reopened = SqliteSnapshotStore::new(path).await.unwrap();
        assert_eq!(
            reopened.list_session_snapshots().await.unwrap(),
            vec![ChatId::new(1)]
        );
    }
}
