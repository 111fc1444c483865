//! Snapshot Storage
//!
//! Session state is persisted as opaque JSON documents keyed by chat. The
//! core decides the document format; stores only keep the latest copy.

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::{ChatId, UserId};

/// Key-value store for session snapshots and the global ban list.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SnapshotStore;
///
/// async fn backup(store: &dyn SnapshotStore) -> bridge_traits::error::Result<()> {
///     for chat_id in store.list_session_snapshots().await? {
///         if let Some(doc) = store.load_session_snapshot(chat_id).await? {
///             println!("{}: {} bytes", chat_id, doc.len());
///         }
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot of a chat.
    async fn save_session_snapshot(&self, chat_id: ChatId, snapshot: &str) -> Result<()>;

    async fn load_session_snapshot(&self, chat_id: ChatId) -> Result<Option<String>>;

    /// Deleting a missing snapshot is not an error.
    async fn delete_session_snapshot(&self, chat_id: ChatId) -> Result<()>;

    async fn list_session_snapshots(&self) -> Result<Vec<ChatId>>;

    /// Replace the whole ban list.
    async fn save_banned_users(&self, users: &[UserId]) -> Result<()>;

    async fn load_banned_users(&self) -> Result<Vec<UserId>>;
}
