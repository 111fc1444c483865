//! # Session Registry
//!
//! Owns the map from chat to running session actor.
//!
//! - [`SessionRegistry::get_or_create`] spawns an actor on first use.
//! - [`SessionRegistry::destroy`] is idempotent: it shuts the actor down
//!   (jobs cancelled, stream closed, call left, temp files and snapshot
//!   removed) or, if no actor is running, still removes any leftovers.
//! - [`SessionRegistry::restore_all`] recreates sessions from stored
//!   snapshots at startup.
//! - The reaper task consumes teardown requests from the actors. An idle
//!   session is only retired by the actor itself, in the same turn that
//!   confirms it is still idle.

use bridge_traits::ChatId;
use core_playback::{
    SessionContext, SessionHandle, TeardownReason, TeardownReceiver, TeardownRequest,
    TeardownSender,
};
use core_queue::SessionSnapshot;
use core_runtime::events::{CoreEvent, SessionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;

pub struct SessionRegistry {
    ctx: Arc<SessionContext>,
    sessions: RwLock<HashMap<ChatId, SessionHandle>>,
    teardown_tx: TeardownSender,
    teardown_rx: Mutex<Option<TeardownReceiver>>,
}

impl SessionRegistry {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            teardown_tx,
            teardown_rx: Mutex::new(Some(teardown_rx)),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(bus) = &self.ctx.event_bus {
            let _ = bus.emit(CoreEvent::Session(event));
        }
    }

    /// The running session of a chat, if any.
    pub async fn get(&self, chat_id: ChatId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&chat_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub async fn get_or_create(&self, chat_id: ChatId) -> SessionHandle {
        if let Some(handle) = self.get(chat_id).await {
            return handle;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&chat_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (handle, _task) =
            SessionHandle::spawn(chat_id, self.ctx.clone(), self.teardown_tx.clone(), None);
        sessions.insert(chat_id, handle.clone());
        info!(active = sessions.len(), "Session created");
        self.emit(SessionEvent::Created { chat_id });
        handle
    }

    /// Tear a session down. Returns whether an actor was running.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub async fn destroy(&self, chat_id: ChatId, reason: &str) -> Result<bool> {
        let handle = self.sessions.write().await.remove(&chat_id);

        let was_running = match handle {
            Some(handle) => match handle.shutdown(reason).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "Session already stopped");
                    false
                }
            },
            None => false,
        };

        if !was_running {
            self.ctx.temp_files().release_session(chat_id);
            self.ctx.store.delete_session_snapshot(chat_id).await?;
            return Ok(false);
        }

        info!(reason, "Session destroyed");
        self.emit(SessionEvent::Destroyed {
            chat_id,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Chats with a running session, in ascending order.
    pub async fn list_active(&self) -> Vec<ChatId> {
        let mut active: Vec<ChatId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(chat_id, _)| *chat_id)
            .collect();
        active.sort();
        active
    }

    pub async fn len(&self) -> usize {
        self.list_active().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Recreate every stored session. Unreadable or empty snapshots are
    /// deleted. Returns the number of sessions restored.
    #[instrument(skip(self))]
    pub async fn restore_all(&self) -> Result<usize> {
        let stored = self.ctx.store.list_session_snapshots().await?;
        let mut restored = 0;

        for chat_id in stored {
            let snapshot = match self.load_snapshot(chat_id).await {
                Some(snapshot) if !snapshot.tracks.is_empty() => snapshot,
                _ => {
                    if let Err(e) = self.ctx.store.delete_session_snapshot(chat_id).await {
                        warn!(chat_id = %chat_id, error = %e, "Failed to delete stale snapshot");
                    }
                    continue;
                }
            };

            let tracks = snapshot.tracks.len();
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&chat_id) {
                continue;
            }
            let (handle, _task) = SessionHandle::spawn(
                chat_id,
                self.ctx.clone(),
                self.teardown_tx.clone(),
                Some(snapshot),
            );
            sessions.insert(chat_id, handle);
            drop(sessions);

            info!(chat_id = %chat_id, tracks, "Session restored");
            self.emit(SessionEvent::Restored { chat_id, tracks });
            restored += 1;
        }

        Ok(restored)
    }

    async fn load_snapshot(&self, chat_id: ChatId) -> Option<SessionSnapshot> {
        let json = match self.ctx.store.load_session_snapshot(chat_id).await {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Failed to load session snapshot");
                return None;
            }
        };
        match SessionSnapshot::from_json(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Discarding unreadable session snapshot");
                None
            }
        }
    }

    /// Act on a teardown request from an actor.
    pub async fn handle_teardown(&self, request: TeardownRequest) -> Result<bool> {
        let TeardownRequest { chat_id, reason } = request;
        match reason {
            TeardownReason::Fatal(error) => {
                warn!(chat_id = %chat_id, error = %error, "Session failed");
                self.destroy(chat_id, &format!("fatal: {}", error)).await
            }
            TeardownReason::IdleTimeout => {
                // Holding the map keeps `get_or_create` from handing out the
                // handle while the actor decides.
                let mut sessions = self.sessions.write().await;
                let Some(handle) = sessions.get(&chat_id).cloned() else {
                    return Ok(false);
                };
                match handle.retire_if_idle("idle timeout").await {
                    Ok(true) => {
                        sessions.remove(&chat_id);
                        drop(sessions);
                        info!(chat_id = %chat_id, reason = "idle timeout", "Session destroyed");
                        self.emit(SessionEvent::Destroyed {
                            chat_id,
                            reason: "idle timeout".to_string(),
                        });
                        Ok(true)
                    }
                    Ok(false) => {
                        debug!(chat_id = %chat_id, "Session became active again, keeping it");
                        Ok(false)
                    }
                    Err(_) => {
                        sessions.remove(&chat_id);
                        drop(sessions);
                        self.destroy(chat_id, "actor stopped").await
                    }
                }
            }
        }
    }

    /// Run the teardown loop until `shutdown` fires. Only the first call
    /// starts a reaper.
    pub async fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut requests = self.teardown_rx.lock().await.take()?;
        let registry = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        if let Err(e) = registry.handle_teardown(request).await {
                            warn!(error = %e, "Teardown failed");
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        }))
    }

    /// Stop every actor but keep their snapshots for the next start.
    pub async fn suspend_all(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        let mut suspended = 0;
        for handle in handles {
            match handle.suspend().await {
                Ok(()) => suspended += 1,
                Err(e) => debug!(chat_id = %handle.chat_id(), error = %e, "Session already stopped"),
            }
        }
        info!(suspended, "Sessions suspended");
        suspended
    }
}
