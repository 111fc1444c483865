//! Chat transport callbacks.

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::ChatId;

/// Delivers replies and exposes call membership.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    /// Send a text message to the chat.
    async fn notify(&self, chat_id: ChatId, message: &str) -> Result<()>;

    /// Number of users currently listening in the chat's voice call,
    /// excluding the bot itself.
    async fn listener_count(&self, chat_id: ChatId) -> Result<usize>;
}
