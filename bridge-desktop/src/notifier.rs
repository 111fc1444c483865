//! Chat notifier that writes replies to the log.

use async_trait::async_trait;
use bridge_traits::{chat::ChatNotifier, error::Result, ChatId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

/// Logs every message instead of delivering it.
///
/// Useful for running the engine headless. Listener counts default to
/// `default_listeners` and can be overridden per chat.
pub struct ConsoleNotifier {
    default_listeners: usize,
    listeners: RwLock<HashMap<ChatId, usize>>,
}

impl ConsoleNotifier {
    pub fn new(default_listeners: usize) -> Self {
        Self {
            default_listeners,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_listeners(&self, chat_id: ChatId, count: usize) {
        self.listeners.write().insert(chat_id, count);
    }
}

impl Default for ConsoleNotifier {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ChatNotifier for ConsoleNotifier {
    async fn notify(&self, chat_id: ChatId, message: &str) -> Result<()> {
        info!(target: "voicecast::chat", chat_id = %chat_id, "{}", message);
        Ok(())
    }

    async fn listener_count(&self, chat_id: ChatId) -> Result<usize> {
        Ok(self
            .listeners
            .read()
            .get(&chat_id)
            .copied()
            .unwrap_or(self.default_listeners))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_overrides() {
        let notifier = ConsoleNotifier::new(2);
        let chat = ChatId::new(-1);
        assert_eq!(notifier.listener_count(chat).await.unwrap(), 2);

        notifier.set_listeners(chat, 9);
        assert_eq!(notifier.listener_count(chat).await.unwrap(), 9);
        assert_eq!(notifier.listener_count(ChatId::new(4)).await.unwrap(), 2);
        notifier.notify(chat, "hello").await.unwrap();
    }
}
