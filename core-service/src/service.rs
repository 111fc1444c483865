//! # Core Service
//!
//! The façade a chat client talks to. It wires the collaborators into the
//! engine, runs the background tasks (teardown reaper, egress rotation,
//! temp-file sweeper), and turns [`Command`]s into session operations.
//!
//! Every command produces a reply that is both sent to the chat through the
//! [`ChatNotifier`] and returned to the caller.
//!
//! ## Command checks
//!
//! In order: banned users are rejected, non-admins are rate limited, and
//! admin-only commands are refused for everyone else.

use bridge_traits::{
    ChatId, ChatNotifier, Clock, MediaFetcher, MediaKind, PlayableSource, SnapshotStore,
    SourceResolver, StreamingSink, Transcoder, UserId,
};
use core_fetch::{
    EgressPool, FetchPool, IdentityStats, PoolConfig, PoolStats, TempFileStats, TempFiles,
};
use core_playback::{
    NowPlaying, PlaybackError, Removed, SessionContext, SessionHandle, SkipOutcome,
};
use core_queue::{format_duration, parse_time_string, Track};
use core_runtime::events::{EventBus, EventStream};
use core_runtime::EngineConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bans::BanList;
use crate::command::{Command, CommandKind, Reply};
use crate::error::{Result, ServiceError};
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;

const EVENT_BUS_CAPACITY: usize = 256;

/// Host-provided collaborators.
pub struct CoreDependencies {
    pub resolver: Arc<dyn SourceResolver>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub sink: Arc<dyn StreamingSink>,
    pub notifier: Arc<dyn ChatNotifier>,
    pub store: Arc<dyn SnapshotStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub active_sessions: usize,
    pub pool: PoolStats,
    pub temp_files: TempFileStats,
    pub egress: Vec<IdentityStats>,
}

pub struct CoreService {
    config: Arc<EngineConfig>,
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn SourceResolver>,
    notifier: Arc<dyn ChatNotifier>,
    fetch_pool: Arc<FetchPool>,
    bans: BanList,
    rate_limiter: Arc<RateLimiter>,
    event_bus: Arc<EventBus>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreService {
    /// Validate the configuration, start the worker pool and background
    /// tasks, and restore stored sessions.
    #[instrument(skip_all)]
    pub async fn start(config: EngineConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let event_bus = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));

        let temp_files = Arc::new(TempFiles::new(
            config.temp_dir.clone(),
            config.temp_file_cleanup,
            deps.clock.clone(),
        ));
        temp_files.ensure_dir().await.map_err(|e| {
            ServiceError::InitializationFailed(format!(
                "cannot create temp dir {}: {}",
                config.temp_dir.display(),
                e
            ))
        })?;
        match temp_files.clear_unreferenced().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed leftover temp files"),
            Err(e) => warn!(error = %e, "Failed to clear leftover temp files"),
        }

        let egress = Arc::new(
            EgressPool::from_config(&config, deps.clock.clone())?
                .with_event_bus(event_bus.clone()),
        );
        let fetch_pool = Arc::new(FetchPool::start_with_events(
            PoolConfig::from(config.as_ref()),
            deps.fetcher,
            deps.transcoder,
            egress.clone(),
            temp_files.clone(),
            Some(event_bus.clone()),
        ));

        let ctx = SessionContext::new(
            config.clone(),
            fetch_pool.clone(),
            deps.sink,
            deps.notifier.clone(),
            deps.store.clone(),
            deps.clock.clone(),
        )
        .with_event_bus(event_bus.clone());
        let registry = Arc::new(SessionRegistry::new(Arc::new(ctx)));

        let bans = BanList::load(deps.store).await;
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_commands,
            config.rate_limit_window,
            deps.clock,
        ));

        let shutdown = CancellationToken::new();
        let mut background = Vec::new();
        if let Some(reaper) = registry.spawn_reaper(shutdown.clone()).await {
            background.push(reaper);
        }
        background.push(
            egress
                .clone()
                .spawn_rotation(config.maintenance_interval, shutdown.clone()),
        );
        background.push(
            temp_files
                .clone()
                .spawn_sweeper(config.maintenance_interval, shutdown.clone()),
        );
        background.push(spawn_rate_limit_pruner(
            rate_limiter.clone(),
            config.maintenance_interval,
            shutdown.clone(),
        ));

        let restored = match registry.restore_all().await {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, "Failed to restore sessions");
                0
            }
        };

        info!(
            workers = config.max_downloads,
            identities = egress.len(),
            restored,
            "Core service started"
        );

        Ok(Self {
            config,
            registry,
            resolver: deps.resolver,
            notifier: deps.notifier,
            fetch_pool,
            bans,
            rate_limiter,
            event_bus,
            shutdown,
            background: Mutex::new(background),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_sessions: self.registry.len().await,
            pool: self.fetch_pool.stats(),
            temp_files: self.fetch_pool.temp_files().stats(),
            egress: self.fetch_pool.egress().stats(),
        }
    }

    /// Tear down a chat's session, e.g. when the bot was removed from it.
    pub async fn destroy_session(&self, chat_id: ChatId) -> Result<bool> {
        self.registry.destroy(chat_id, "removed by host").await
    }

    /// Run a command, notify the chat and return the reply.
    #[instrument(
        skip(self, command),
        fields(chat_id = %command.chat_id, user_id = %command.user, command = command.kind.name())
    )]
    pub async fn execute(&self, command: Command) -> Reply {
        let chat_id = command.chat_id;
        let (message, success) = match self.dispatch(command).await {
            Ok(message) => (message, true),
            Err(e) => {
                if e.is_user_error() {
                    debug!(error = %e, "Command rejected");
                } else {
                    warn!(error = %e, "Command failed");
                }
                (e.to_string(), false)
            }
        };

        if let Err(e) = self.notifier.notify(chat_id, &message).await {
            warn!(error = %e, "Failed to deliver reply");
        }
        Reply {
            chat_id,
            message,
            success,
        }
    }

    async fn dispatch(&self, command: Command) -> Result<String> {
        let Command {
            chat_id,
            user,
            is_admin,
            kind,
        } = command;

        if !is_admin && self.bans.is_banned(user).await {
            return Err(ServiceError::Banned);
        }
        if !is_admin {
            self.rate_limiter
                .check(user)
                .map_err(|retry_after| ServiceError::RateLimited { retry_after })?;
        }
        if kind.requires_admin() && !is_admin {
            return Err(ServiceError::AdminRequired(kind.name()));
        }

        match kind {
            CommandKind::Play { query } => {
                self.enqueue(chat_id, user, &query, MediaKind::Audio).await
            }
            CommandKind::PlayVideo { query } => {
                self.enqueue(chat_id, user, &query, MediaKind::Video).await
            }
            CommandKind::Playlist { query } => self.enqueue_playlist(chat_id, user, &query).await,
            CommandKind::Skip => {
                let outcome = self.session(chat_id).await?.skip(user, is_admin).await?;
                Ok(match outcome {
                    SkipOutcome::Skipped { title } => format!("Skipped {}", title),
                    SkipOutcome::VoteRegistered { votes, required } => {
                        format!("Skip vote registered ({}/{})", votes, required)
                    }
                    SkipOutcome::AlreadyVoted { votes, required } => {
                        format!("You already voted to skip ({}/{})", votes, required)
                    }
                })
            }
            CommandKind::Pause => {
                let position = self.session(chat_id).await?.pause().await?;
                Ok(format!("Paused at {}", format_duration(position.as_secs())))
            }
            CommandKind::Resume => {
                let position = self.session(chat_id).await?.resume().await?;
                Ok(format!("Resumed at {}", format_duration(position.as_secs())))
            }
            CommandKind::Queue => match self.registry.get(chat_id).await {
                Some(session) => Ok(session.queue_page().await?),
                None => Ok("The queue is empty".to_string()),
            },
            CommandKind::NowPlaying => {
                let status = self.session(chat_id).await?.status().await?;
                match status.now_playing {
                    Some(now_playing) => Ok(describe_now_playing(&now_playing)),
                    None => Err(PlaybackError::NothingPlaying.into()),
                }
            }
            CommandKind::Seek { time } => {
                let seconds = parse_time_string(&time)?;
                let session = self.session(chat_id).await?;
                let position = session.seek(Duration::from_secs(seconds)).await?;
                Ok(format!("Seeked to {}", format_duration(position.as_secs())))
            }
            CommandKind::Volume { level } => {
                let applied = self.session(chat_id).await?.set_volume(level).await?;
                Ok(format!("Volume set to {}%", applied))
            }
            CommandKind::Loop { mode } => {
                self.session(chat_id).await?.set_loop_mode(mode).await?;
                Ok(format!("Loop mode: {}", mode))
            }
            CommandKind::Shuffle => {
                let len = self.session(chat_id).await?.shuffle().await?;
                Ok(format!("Shuffled {} tracks", len))
            }
            CommandKind::Remove { position } => {
                match self.session(chat_id).await?.remove(position).await? {
                    Removed::Track(track) => Ok(format!("Removed {}", track.title())),
                    Removed::SkippedCurrent { title } => Ok(format!("Skipped {}", title)),
                }
            }
            CommandKind::Move { from, to } => {
                self.session(chat_id).await?.move_track(from, to).await?;
                Ok(format!("Moved track {} to position {}", from, to))
            }
            CommandKind::Stop => {
                let removed = self.session(chat_id).await?.stop().await?;
                Ok(format!("Stopped playback and cleared {} tracks", removed))
            }
            CommandKind::History => {
                let Some(session) = self.registry.get(chat_id).await else {
                    return Ok("Nothing has been played yet".to_string());
                };
                let played = session.history(10).await?;
                Ok(describe_history(&played))
            }
            CommandKind::ClearTemp => self.clear_temp().await,
            CommandKind::Ban { user: target } => Ok(if self.bans.ban(target).await {
                format!("User {} is now banned", target)
            } else {
                format!("User {} was already banned", target)
            }),
            CommandKind::Unban { user: target } => Ok(if self.bans.unban(target).await {
                format!("User {} is no longer banned", target)
            } else {
                format!("User {} was not banned", target)
            }),
        }
    }

    async fn session(&self, chat_id: ChatId) -> Result<SessionHandle> {
        self.registry
            .get(chat_id)
            .await
            .ok_or(ServiceError::NoActiveSession)
    }

    /// Resolve a query, asking once more when the provider was unavailable.
    async fn resolve(&self, query: &str) -> Result<PlayableSource> {
        match self.resolver.resolve(query).await {
            Ok(source) => Ok(source),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Resolver unavailable, retrying once");
                Ok(self.resolver.resolve(query).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_playlist(&self, query: &str, limit: usize) -> Result<Vec<PlayableSource>> {
        match self.resolver.resolve_playlist(query, limit).await {
            Ok(sources) => Ok(sources),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Resolver unavailable, retrying once");
                Ok(self.resolver.resolve_playlist(query, limit).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue(
        &self,
        chat_id: ChatId,
        user: UserId,
        query: &str,
        media: MediaKind,
    ) -> Result<String> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "Tell me what to play".to_string(),
            ));
        }

        let source = self.resolve(query).await?;
        let session = self.registry.get_or_create(chat_id).await;
        let enqueued = session.enqueue(user, source, media).await?;

        Ok(if enqueued.position == 1 {
            format!("Loading {}", describe_track(&enqueued.track))
        } else {
            format!(
                "Added to queue at position {}: {}",
                enqueued.position,
                describe_track(&enqueued.track)
            )
        })
    }

    async fn enqueue_playlist(&self, chat_id: ChatId, user: UserId, query: &str) -> Result<String> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "Tell me which playlist to play".to_string(),
            ));
        }

        let limit = self.config.max_playlist_size;
        let mut sources = self.resolve_playlist(query, limit).await?;
        sources.truncate(limit);
        if sources.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "The playlist is empty".to_string(),
            ));
        }

        let session = self.registry.get_or_create(chat_id).await;
        let outcome = session
            .enqueue_many(user, sources, MediaKind::Audio)
            .await?;

        if outcome.added.is_empty() {
            return Err(match outcome.first_error {
                Some(e) => e.into(),
                None => ServiceError::InvalidArgument("No playlist entries were added".to_string()),
            });
        }

        let mut message = format!("Added {} tracks from the playlist", outcome.added.len());
        if outcome.rejected > 0 {
            message.push_str(&format!(", {} skipped", outcome.rejected));
            if let Some(e) = outcome.first_error {
                message.push_str(&format!(" ({})", e));
            }
        }
        Ok(message)
    }

    async fn clear_temp(&self) -> Result<String> {
        let temp_files = self.fetch_pool.temp_files();
        let expired = temp_files.sweep();
        let orphaned = temp_files
            .clear_unreferenced()
            .await
            .map_err(bridge_traits::BridgeError::from)?;
        info!(expired, orphaned, "Temp files cleared");
        Ok(format!("Removed {} temporary files", expired + orphaned))
    }

    /// Stop background tasks and workers. Sessions are suspended with their
    /// snapshots kept so the next start restores them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let suspended = self.registry.suspend_all().await;
        self.fetch_pool.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(suspended, "Core service stopped");
    }
}

fn spawn_rate_limit_pruner(
    limiter: Arc<RateLimiter>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = limiter.prune();
                    if pruned > 0 {
                        debug!(pruned, "Forgot quiet users");
                    }
                }
            }
        }
    })
}

fn describe_track(track: &Track) -> String {
    if track.is_live() {
        format!("{} [Live]", track.title())
    } else {
        format!(
            "{} [{}]",
            track.title(),
            format_duration(track.duration_seconds())
        )
    }
}

fn describe_now_playing(now_playing: &NowPlaying) -> String {
    let track = &now_playing.track;
    let position = format_duration(now_playing.position.as_secs());
    let progress = if track.is_live() {
        format!("{} / Live", position)
    } else {
        format!(
            "{} / {}",
            position,
            format_duration(track.duration_seconds())
        )
    };
    let paused = if now_playing.paused { " (paused)" } else { "" };
    format!("Now playing: {} [{}]{}", track.title(), progress, paused)
}

fn describe_history(played: &[Track]) -> String {
    if played.is_empty() {
        return "Nothing has been played yet".to_string();
    }
    let mut lines = vec!["Recently played:".to_string()];
    for (index, track) in played.iter().enumerate() {
        lines.push(format!("{}. {}", index + 1, describe_track(track)));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{PlayableSource, Provider};
    use chrono::Utc;

    fn track(source: PlayableSource) -> Track {
        Track::new(source, MediaKind::Audio, UserId::new(1), Utc::now())
    }

    #[test]
    fn test_describe_track() {
        let song = track(PlayableSource::new(Provider::Youtube, "yt:a", "Song", 3725));
        assert_eq!(describe_track(&song), "Song [1:02:05]");

        let radio = track(PlayableSource::live(Provider::Youtube, "yt:l", "Radio"));
        assert_eq!(describe_track(&radio), "Radio [Live]");
    }

    #[test]
    fn test_describe_now_playing() {
        let now_playing = NowPlaying {
            track: track(PlayableSource::new(Provider::Youtube, "yt:a", "Song", 200)),
            position: Duration::from_secs(65),
            paused: true,
        };
        assert_eq!(
            describe_now_playing(&now_playing),
            "Now playing: Song [1:05 / 3:20] (paused)"
        );
    }

    #[test]
    fn test_describe_history() {
        assert_eq!(describe_history(&[]), "Nothing has been played yet");
        let played = vec![track(PlayableSource::new(Provider::Youtube, "yt:a", "A", 60))];
        assert_eq!(describe_history(&played), "Recently played:\n1. A [1:00]");
    }
}
