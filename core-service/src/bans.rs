//! Banned users, persisted through the [`SnapshotStore`].

use bridge_traits::{SnapshotStore, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct BanList {
    users: RwLock<HashSet<UserId>>,
    store: Arc<dyn SnapshotStore>,
}

impl BanList {
    /// Load the stored list. A store failure starts with an empty list.
    pub async fn load(store: Arc<dyn SnapshotStore>) -> Self {
        let users = match store.load_banned_users().await {
            Ok(users) => users.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Failed to load ban list, starting empty");
                HashSet::new()
            }
        };
        Self {
            users: RwLock::new(users),
            store,
        }
    }

    pub async fn is_banned(&self, user: UserId) -> bool {
        self.users.read().await.contains(&user)
    }

    /// Returns `false` if the user was already banned.
    pub async fn ban(&self, user: UserId) -> bool {
        let mut users = self.users.write().await;
        if !users.insert(user) {
            return false;
        }
        self.save(&users).await;
        info!(user_id = %user, "User banned");
        true
    }

    /// Returns `false` if the user was not banned.
    pub async fn unban(&self, user: UserId) -> bool {
        let mut users = self.users.write().await;
        if !users.remove(&user) {
            return false;
        }
        self.save(&users).await;
        info!(user_id = %user, "User unbanned");
        true
    }

    pub async fn list(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.read().await.iter().copied().collect();
        users.sort();
        users
    }

    /// Failures are logged; the next ban or unban writes the full list again.
    async fn save(&self, users: &HashSet<UserId>) {
        let mut sorted: Vec<UserId> = users.iter().copied().collect();
        sorted.sort();
        if let Err(e) = self.store.save_banned_users(&sorted).await {
            warn!(error = %e, "Failed to save ban list");
        }
    }
}
