//! # Session Actor
//!
//! One task per chat owns the [`SessionQueue`] and the playback state
//! machine. Everything that touches a session goes through its mailbox:
//!
//! - commands from the chat (via [`SessionHandle`]),
//! - [`FetchReport`]s from the worker pool,
//! - [`SinkEvent`]s from the voice transport (tagged with a [`StreamId`];
//!   events from a closed stream are dropped),
//! - the idle timer.
//!
//! The actor processes one message at a time, so no two commands for the
//! same chat ever run concurrently while different chats run in parallel.
//!
//! ## Head-of-line playback
//!
//! Tracks are fetched as soon as they are enqueued (background priority,
//! interactive for the head), but only the head is ever played. A later
//! track that finishes first just waits in `Ready`.
//!
//! ## Teardown
//!
//! After `auto_leave_delay` of idling with an empty queue the actor asks the
//! registry to tear it down. The registry then sends
//! [`SessionHandle::retire_if_idle`], which checks and tears down in one
//! actor turn: a command that arrived first keeps the session alive, and one
//! that arrives after is rejected with [`PlaybackError::SessionClosed`].

use bridge_traits::{
    ChatId, ChatNotifier, Clock, MediaKind, PlayableSource, SinkEvent, SinkEventKind,
    SinkEventReceiver, SinkEventSender, SnapshotStore, StreamId, StreamOptions, StreamSession,
    StreamingSink, UserId,
};
use core_fetch::{
    FetchError, FetchJob, FetchOutcome, FetchPool, FetchReport, Priority, ReportReceiver,
    ReportSender, TempFiles,
};
use core_queue::{
    format_queue_page, LoopMode, QueueError, QueueLimits, RemoveOutcome, SessionQueue,
    SessionSnapshot, Track, TrackId, TrackStatus,
};
use core_runtime::config::MAX_VOLUME;
use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent, QueueEvent};
use core_runtime::EngineConfig;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PlaybackError, Result};
use crate::state::{PlaybackState, PositionAnchor, VoteTally};

const COMMAND_BUFFER: usize = 64;

// ============================================================================
// Shared context
// ============================================================================

/// Collaborators shared by every session.
pub struct SessionContext {
    pub config: Arc<EngineConfig>,
    pub fetch_pool: Arc<FetchPool>,
    pub sink: Arc<dyn StreamingSink>,
    pub notifier: Arc<dyn ChatNotifier>,
    pub store: Arc<dyn SnapshotStore>,
    pub clock: Arc<dyn Clock>,
    pub event_bus: Option<Arc<EventBus>>,
    stream_ids: AtomicU64,
}

impl SessionContext {
    pub fn new(
        config: Arc<EngineConfig>,
        fetch_pool: Arc<FetchPool>,
        sink: Arc<dyn StreamingSink>,
        notifier: Arc<dyn ChatNotifier>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            fetch_pool,
            sink,
            notifier,
            store,
            clock,
            event_bus: None,
            stream_ids: AtomicU64::new(1),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn temp_files(&self) -> &Arc<TempFiles> {
        self.fetch_pool.temp_files()
    }

    fn next_stream_id(&self) -> StreamId {
        StreamId(self.stream_ids.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, event: CoreEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(event);
        }
    }
}

// ============================================================================
// Teardown requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// Idle with an empty queue for `auto_leave_delay`. Needs confirmation.
    IdleTimeout,
    /// The session cannot continue (e.g. the voice stream could not be opened).
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownRequest {
    pub chat_id: ChatId,
    pub reason: TeardownReason,
}

pub type TeardownSender = mpsc::UnboundedSender<TeardownRequest>;
pub type TeardownReceiver = mpsc::UnboundedReceiver<TeardownRequest>;

// ============================================================================
// Command replies
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub track: Track,
    /// 1-based position at the time of the enqueue.
    pub position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistOutcome {
    pub added: Vec<Track>,
    pub rejected: usize,
    pub first_error: Option<QueueError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipOutcome {
    Skipped { title: String },
    VoteRegistered { votes: usize, required: usize },
    AlreadyVoted { votes: usize, required: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removed {
    Track(Track),
    /// The position named the current track, which was skipped instead.
    SkippedCurrent { title: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub track: Track,
    pub position: Duration,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub chat_id: ChatId,
    pub state: PlaybackState,
    pub now_playing: Option<NowPlaying>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub queue_len: usize,
}

// ============================================================================
// Commands
// ============================================================================

enum SessionCommand {
    Enqueue {
        user: UserId,
        source: PlayableSource,
        media: MediaKind,
        reply: oneshot::Sender<Result<Enqueued>>,
    },
    EnqueueMany {
        user: UserId,
        sources: Vec<PlayableSource>,
        media: MediaKind,
        reply: oneshot::Sender<PlaylistOutcome>,
    },
    Skip {
        user: UserId,
        is_admin: bool,
        reply: oneshot::Sender<Result<SkipOutcome>>,
    },
    Pause {
        reply: oneshot::Sender<Result<Duration>>,
    },
    Resume {
        reply: oneshot::Sender<Result<Duration>>,
    },
    Seek {
        position: Duration,
        reply: oneshot::Sender<Result<Duration>>,
    },
    SetVolume {
        volume: u16,
        reply: oneshot::Sender<Result<u16>>,
    },
    SetLoopMode {
        mode: LoopMode,
        reply: oneshot::Sender<()>,
    },
    Shuffle {
        reply: oneshot::Sender<usize>,
    },
    Remove {
        position: usize,
        reply: oneshot::Sender<Result<Removed>>,
    },
    Move {
        from: usize,
        to: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    QueuePage {
        reply: oneshot::Sender<String>,
    },
    History {
        limit: usize,
        reply: oneshot::Sender<Vec<Track>>,
    },
    RetireIfIdle {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reason: String,
        forget: bool,
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable mailbox of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    chat_id: ChatId,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Start the actor for `chat_id`, optionally from a stored snapshot.
    pub fn spawn(
        chat_id: ChatId,
        ctx: Arc<SessionContext>,
        teardown: TeardownSender,
        restored: Option<SessionSnapshot>,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = SessionActor::new(chat_id, ctx, teardown, restored);
        let task = tokio::spawn(actor.run(commands_rx));
        (
            Self {
                chat_id,
                commands: commands_tx,
            },
            task,
        )
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| PlaybackError::SessionClosed(self.chat_id.to_string()))?;
        response
            .await
            .map_err(|_| PlaybackError::SessionClosed(self.chat_id.to_string()))
    }

    pub async fn enqueue(
        &self,
        user: UserId,
        source: PlayableSource,
        media: MediaKind,
    ) -> Result<Enqueued> {
        self.request(|reply| SessionCommand::Enqueue {
            user,
            source,
            media,
            reply,
        })
        .await?
    }

    pub async fn enqueue_many(
        &self,
        user: UserId,
        sources: Vec<PlayableSource>,
        media: MediaKind,
    ) -> Result<PlaylistOutcome> {
        self.request(|reply| SessionCommand::EnqueueMany {
            user,
            sources,
            media,
            reply,
        })
        .await
    }

    pub async fn skip(&self, user: UserId, is_admin: bool) -> Result<SkipOutcome> {
        self.request(|reply| SessionCommand::Skip {
            user,
            is_admin,
            reply,
        })
        .await?
    }

    pub async fn pause(&self) -> Result<Duration> {
        self.request(|reply| SessionCommand::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<Duration> {
        self.request(|reply| SessionCommand::Resume { reply }).await?
    }

    pub async fn seek(&self, position: Duration) -> Result<Duration> {
        self.request(|reply| SessionCommand::Seek { position, reply })
            .await?
    }

    /// Returns the volume actually applied after clamping.
    pub async fn set_volume(&self, volume: u16) -> Result<u16> {
        self.request(|reply| SessionCommand::SetVolume { volume, reply })
            .await?
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        self.request(|reply| SessionCommand::SetLoopMode { mode, reply })
            .await
    }

    pub async fn shuffle(&self) -> Result<usize> {
        self.request(|reply| SessionCommand::Shuffle { reply }).await
    }

    pub async fn remove(&self, position: usize) -> Result<Removed> {
        self.request(|reply| SessionCommand::Remove { position, reply })
            .await?
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<()> {
        self.request(|reply| SessionCommand::Move { from, to, reply })
            .await?
    }

    /// Clear the queue and stop playback. Returns the number of tracks removed.
    pub async fn stop(&self) -> Result<usize> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| SessionCommand::Status { reply }).await
    }

    pub async fn queue_page(&self) -> Result<String> {
        self.request(|reply| SessionCommand::QueuePage { reply }).await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<Track>> {
        self.request(|reply| SessionCommand::History { limit, reply })
            .await
    }

    /// Destroy the session if it is still idle and quiet, like
    /// [`shutdown`](Self::shutdown). Returns `false` and keeps the session
    /// when it became active again.
    pub async fn retire_if_idle(&self, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        self.request(|reply| SessionCommand::RetireIfIdle { reason, reply })
            .await
    }

    /// Cancel jobs, close the stream, leave the call, delete temp files and
    /// the stored snapshot, then stop the actor.
    pub async fn shutdown(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| SessionCommand::Shutdown {
            reason,
            forget: true,
            reply,
        })
        .await
    }

    /// Like [`shutdown`](Self::shutdown) but saves the snapshot instead of
    /// deleting it, so the session can be restored on the next start.
    pub async fn suspend(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Shutdown {
            reason: "engine shutdown".to_string(),
            forget: false,
            reply,
        })
        .await
    }
}

// ============================================================================
// Actor
// ============================================================================

struct ActiveStream {
    id: StreamId,
    track_id: TrackId,
    path: PathBuf,
    session: Box<dyn StreamSession>,
}

enum StreamStart {
    Started,
    Refetching,
    Failed(String),
    Fatal,
}

struct SessionActor {
    chat_id: ChatId,
    ctx: Arc<SessionContext>,
    queue: SessionQueue,
    state: PlaybackState,
    volume: u16,
    stream: Option<ActiveStream>,
    anchor: PositionAnchor,
    votes: VoteTally,
    jobs: HashMap<TrackId, CancellationToken>,
    deferred: HashSet<TrackId>,
    cancel: CancellationToken,
    reports_tx: ReportSender,
    reports_rx: ReportReceiver,
    sink_tx: SinkEventSender,
    sink_rx: SinkEventReceiver,
    teardown: TeardownSender,
    last_activity: Instant,
    idle_deadline: Option<Instant>,
    resume_at: Option<Duration>,
    restored: bool,
    fatal: bool,
}

impl SessionActor {
    fn new(
        chat_id: ChatId,
        ctx: Arc<SessionContext>,
        teardown: TeardownSender,
        restored: Option<SessionSnapshot>,
    ) -> Self {
        let limits = QueueLimits::from(ctx.config.as_ref());
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();

        let (queue, volume, resume_at, was_restored) = match restored {
            Some(snapshot) => {
                let volume = snapshot.volume.min(MAX_VOLUME);
                let resume_at =
                    (snapshot.position_ms > 0).then(|| Duration::from_millis(snapshot.position_ms));
                (snapshot.restore(limits), volume, resume_at, true)
            }
            None => (
                SessionQueue::new(chat_id, limits),
                ctx.config.default_volume,
                None,
                false,
            ),
        };

        Self {
            chat_id,
            ctx,
            queue,
            state: PlaybackState::Idle,
            volume,
            stream: None,
            anchor: PositionAnchor::default(),
            votes: VoteTally::default(),
            jobs: HashMap::new(),
            deferred: HashSet::new(),
            cancel: CancellationToken::new(),
            reports_tx,
            reports_rx,
            sink_tx,
            sink_rx,
            teardown,
            last_activity: Instant::now(),
            idle_deadline: None,
            resume_at,
            restored: was_restored,
            fatal: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        debug!(chat_id = %self.chat_id, "Session actor started");
        self.bootstrap().await;

        loop {
            let idle_deadline = self.idle_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown { reason, forget, reply }) => {
                        self.teardown(&reason, forget).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(SessionCommand::RetireIfIdle { reason, reply }) => {
                        if self.try_retire() {
                            self.teardown(&reason, true).await;
                            let _ = reply.send(true);
                            break;
                        }
                        let _ = reply.send(false);
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown("session handle dropped", false).await;
                        break;
                    }
                },
                Some(report) = self.reports_rx.recv() => self.handle_report(report).await,
                Some(event) = self.sink_rx.recv() => self.handle_sink_event(event).await,
                _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                    if idle_deadline.is_some() => self.on_idle_timeout(),
            }
        }
        debug!(chat_id = %self.chat_id, "Session actor stopped");
    }

    async fn bootstrap(&mut self) {
        if self.restored && !self.queue.is_empty() {
            info!(chat_id = %self.chat_id, tracks = self.queue.len(), "Resuming restored session");
            let ids: Vec<TrackId> = self.queue.iter().skip(1).map(|t| t.id).collect();
            for id in ids {
                self.submit_fetch(id, Priority::Background).await;
            }
        }
        self.advance().await;
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn emit_playback(&self, event: PlaybackEvent) {
        self.ctx.emit(CoreEvent::Playback(event));
    }

    fn emit_queue(&self, event: QueueEvent) {
        self.ctx.emit(CoreEvent::Queue(event));
    }

    async fn notify(&self, message: &str) {
        if let Err(e) = self.ctx.notifier.notify(self.chat_id, message).await {
            warn!(chat_id = %self.chat_id, error = %e, "Failed to deliver chat notice");
        }
    }

    fn set_state(&mut self, to: PlaybackState) {
        if let Err(e) = self.state.transition(to) {
            error!(chat_id = %self.chat_id, error = %e, "Unexpected playback transition");
            self.state = to;
        }
    }

    fn current_position(&self) -> Duration {
        if self.state.is_streaming() {
            self.anchor.position()
        } else {
            self.resume_at.unwrap_or_default()
        }
    }

    /// Save the session. Failures are logged; the next change saves again.
    async fn persist(&self) {
        let snapshot = SessionSnapshot::capture(
            &self.queue,
            self.volume,
            self.current_position().as_millis() as u64,
            self.ctx.clock.now(),
        );
        let json = match snapshot.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "Failed to encode session snapshot");
                return;
            }
        };
        if let Err(e) = self.ctx.store.save_session_snapshot(self.chat_id, &json).await {
            warn!(
                chat_id = %self.chat_id,
                error = %e,
                "Failed to save session snapshot, retrying on next change"
            );
        }
    }

    fn release_audio(&self, track: &Track) {
        if let Some(audio) = &track.audio {
            self.ctx.temp_files().release(&audio.path);
        }
    }

    fn cancel_job(&mut self, track_id: TrackId) {
        if let Some(token) = self.jobs.remove(&track_id) {
            token.cancel();
        }
        self.deferred.remove(&track_id);
    }

    /// Submit a fetch for a `Queued` track without a job. Returns `false`
    /// when the pool refused it.
    async fn submit_fetch(&mut self, track_id: TrackId, priority: Priority) -> bool {
        let Some(track) = self.queue.get(track_id) else {
            return true;
        };
        if track.status != TrackStatus::Queued || self.jobs.contains_key(&track_id) {
            return true;
        }

        let token = self.cancel.child_token();
        let job = FetchJob::new(
            track_id,
            self.chat_id,
            track.source.clone(),
            track.media,
            priority,
            token.clone(),
            self.reports_tx.clone(),
        );

        match self.ctx.fetch_pool.submit(job).await {
            Ok(()) => {
                self.jobs.insert(track_id, token);
                self.deferred.remove(&track_id);
                true
            }
            Err(FetchError::Backpressure { .. }) => {
                debug!(chat_id = %self.chat_id, track_id = %track_id, "Prefetch deferred");
                self.deferred.insert(track_id);
                true
            }
            Err(e) => {
                warn!(chat_id = %self.chat_id, track_id = %track_id, error = %e, "Fetch submit failed");
                self.deferred.insert(track_id);
                false
            }
        }
    }

    /// Retry deferred prefetches in queue order until the pool pushes back.
    async fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let pending: Vec<TrackId> = self
            .queue
            .iter()
            .filter(|t| self.deferred.contains(&t.id))
            .map(|t| t.id)
            .collect();
        for id in pending {
            self.submit_fetch(id, Priority::Background).await;
            if self.deferred.contains(&id) {
                break;
            }
        }
    }

    async fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.session.close().await {
                warn!(chat_id = %self.chat_id, stream = %stream.id, error = %e, "Failed to close stream");
            }
            self.ctx.temp_files().unpin(&stream.path);
            debug!(chat_id = %self.chat_id, track_id = %stream.track_id, "Stream closed");
        }
    }

    fn enter_idle(&mut self) {
        if self.queue.is_empty() && self.idle_deadline.is_none() {
            self.idle_deadline = Some(Instant::now() + self.ctx.config.auto_leave_delay);
            self.emit_playback(PlaybackEvent::Idle {
                chat_id: self.chat_id,
            });
        }
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    /// From `Idle`, start loading the head track if there is one.
    async fn advance(&mut self) {
        loop {
            if !self.state.is_idle() || self.fatal {
                return;
            }

            let Some(head) = self.queue.head() else {
                self.enter_idle();
                return;
            };
            let head_id = head.id;
            let status = head.status;

            if status.is_terminal() {
                self.queue.complete_head(self.ctx.clock.now());
                continue;
            }

            self.idle_deadline = None;
            self.queue.pin_head();
            self.votes.clear();
            self.set_state(PlaybackState::Loading(head_id));
            self.emit_playback(PlaybackEvent::Loading {
                chat_id: self.chat_id,
                track_id: head_id.to_string(),
            });

            let outcome = match status {
                TrackStatus::Ready => self.start_stream(head_id).await,
                TrackStatus::Queued => {
                    if self.submit_fetch(head_id, Priority::Interactive).await {
                        StreamStart::Refetching
                    } else {
                        StreamStart::Failed("download service unavailable".to_string())
                    }
                }
                _ => StreamStart::Refetching,
            };

            match outcome {
                StreamStart::Failed(reason) => {
                    self.fail_head(&reason).await;
                    continue;
                }
                StreamStart::Started | StreamStart::Refetching | StreamStart::Fatal => return,
            }
        }
    }

    /// Open the voice stream for the loading head.
    async fn start_stream(&mut self, track_id: TrackId) -> StreamStart {
        let (audio, title) = match self.queue.head() {
            Some(head) if head.id == track_id => match &head.audio {
                Some(audio) => (audio.clone(), head.title().to_string()),
                None => return StreamStart::Refetching,
            },
            _ => return StreamStart::Refetching,
        };

        let temp_files = self.ctx.temp_files().clone();
        if !temp_files.pin(&audio.path) || !audio.path.exists() {
            temp_files.unpin(&audio.path);
            info!(chat_id = %self.chat_id, track_id = %track_id, "Cached file gone, fetching again");
            if let Some(head) = self.queue.head_mut() {
                if let Err(e) = head.reset_for_retry() {
                    return StreamStart::Failed(e.to_string());
                }
            }
            return if self.submit_fetch(track_id, Priority::Interactive).await {
                StreamStart::Refetching
            } else {
                StreamStart::Failed("download service unavailable".to_string())
            };
        }

        let start_at = self.resume_at.take().unwrap_or_default();
        let options = StreamOptions {
            stream_id: self.ctx.next_stream_id(),
            volume: self.volume,
            start_at,
        };

        match self
            .ctx
            .sink
            .open_stream(self.chat_id, &audio, options, self.sink_tx.clone())
            .await
        {
            Ok(session) => {
                if let Some(head) = self.queue.head_mut() {
                    if let Err(e) = head.start_playing() {
                        warn!(chat_id = %self.chat_id, error = %e, "Track status out of sync");
                    }
                }
                self.stream = Some(ActiveStream {
                    id: options.stream_id,
                    track_id,
                    path: audio.path.clone(),
                    session,
                });
                self.anchor.start(start_at);
                self.set_state(PlaybackState::Playing(track_id));
                info!(chat_id = %self.chat_id, track_id = %track_id, title = %title, "Playback started");
                self.emit_playback(PlaybackEvent::Started {
                    chat_id: self.chat_id,
                    track_id: track_id.to_string(),
                    title: title.clone(),
                });
                self.notify(&format!("Now playing: {}", title)).await;
                self.persist().await;
                StreamStart::Started
            }
            Err(e) => {
                temp_files.unpin(&audio.path);
                error!(chat_id = %self.chat_id, error = %e, "Failed to open voice stream");
                self.emit_playback(PlaybackEvent::Error {
                    chat_id: self.chat_id,
                    message: e.to_string(),
                });
                self.notify(&format!("Could not join the voice chat: {}", e))
                    .await;
                self.fatal = true;
                let _ = self.teardown.send(TeardownRequest {
                    chat_id: self.chat_id,
                    reason: TeardownReason::Fatal(e.to_string()),
                });
                StreamStart::Fatal
            }
        }
    }

    /// Leave the current track through `Finishing` and apply the loop policy.
    async fn finish_head(&mut self, skipped: bool) {
        let Some(track_id) = self.state.track_id() else {
            return;
        };
        self.set_state(PlaybackState::Finishing(track_id));
        self.close_stream().await;
        self.cancel_job(track_id);

        if let Some(head) = self.queue.head_mut() {
            if head.id == track_id && head.status == TrackStatus::Playing {
                if let Err(e) = head.finish() {
                    warn!(chat_id = %self.chat_id, error = %e, "Track status out of sync");
                }
            }
        }

        let now = self.ctx.clock.now();
        let popped = if skipped {
            self.queue.skip_head(now)
        } else {
            self.queue.complete_head(now)
        };

        if let Some((finished, replay)) = popped {
            if let Some(replay) = replay {
                self.adopt_replay(&replay).await;
            }
            self.release_audio(&finished);
            self.emit_playback(PlaybackEvent::Finished {
                chat_id: self.chat_id,
                track_id: finished.id.to_string(),
                skipped,
            });
        }

        self.anchor.reset();
        self.votes.clear();
        self.set_state(PlaybackState::Idle);
        self.persist().await;
    }

    /// Keep the shared file alive for a loop replay, or fetch it again.
    async fn adopt_replay(&mut self, replay: &Track) {
        let shared = match &replay.audio {
            Some(audio) => self.ctx.temp_files().retain(&audio.path),
            None => false,
        };
        if shared {
            return;
        }
        if let Some(track) = self.queue.get_mut(replay.id) {
            if track.status == TrackStatus::Ready {
                if let Err(e) = track.reset_for_retry() {
                    warn!(chat_id = %self.chat_id, error = %e, "Could not reset replay");
                }
            }
        }
        self.submit_fetch(replay.id, Priority::Background).await;
    }

    /// Mark the current head failed, tell the chat, and drop it.
    async fn fail_head(&mut self, reason: &str) {
        let Some(track_id) = self.state.track_id() else {
            return;
        };
        self.set_state(PlaybackState::Finishing(track_id));
        self.close_stream().await;
        self.cancel_job(track_id);

        let mut title = None;
        if let Some(head) = self.queue.head_mut() {
            if head.id == track_id {
                if let Err(e) = head.fail(reason) {
                    warn!(chat_id = %self.chat_id, error = %e, "Track status out of sync");
                }
                title = Some(head.title().to_string());
            }
        }

        if let Some(title) = title {
            if let Some((failed, _)) = self.queue.complete_head(self.ctx.clock.now()) {
                self.release_audio(&failed);
            }
            warn!(chat_id = %self.chat_id, track_id = %track_id, reason, "Track failed");
            self.emit_playback(PlaybackEvent::TrackFailed {
                chat_id: self.chat_id,
                track_id: track_id.to_string(),
                reason: reason.to_string(),
            });
            self.notify(&format!("Skipping {}: {}", title, reason)).await;
        }

        self.anchor.reset();
        self.votes.clear();
        self.set_state(PlaybackState::Idle);
        self.persist().await;
    }

    /// Drop a failed track that is not the head.
    async fn fail_queued(&mut self, track_id: TrackId, reason: &str) {
        let Some(mut track) = self.queue.remove_track(track_id) else {
            return;
        };
        if let Err(e) = track.fail(reason) {
            debug!(chat_id = %self.chat_id, error = %e, "Track already terminal");
        }
        self.release_audio(&track);
        self.emit_playback(PlaybackEvent::TrackFailed {
            chat_id: self.chat_id,
            track_id: track_id.to_string(),
            reason: reason.to_string(),
        });
        self.notify(&format!("Skipping {}: {}", track.title(), reason))
            .await;
        self.persist().await;
    }

    // ------------------------------------------------------------------------
    // Mailbox handlers
    // ------------------------------------------------------------------------

    async fn handle_report(&mut self, report: FetchReport) {
        let track_id = report.track_id();

        if self.queue.get(track_id).is_none() {
            self.jobs.remove(&track_id);
            if let FetchReport::Finished(result) = &report {
                if let FetchOutcome::Success(audio) = &result.outcome {
                    self.ctx.temp_files().release(&audio.path);
                }
            }
            return;
        }

        match report {
            FetchReport::Started { attempt, identity, .. } => {
                if let Some(track) = self.queue.get_mut(track_id) {
                    if track.status == TrackStatus::Queued {
                        if let Err(e) = track.start_fetch() {
                            debug!(error = %e, "Ignoring fetch start");
                        }
                    }
                }
                debug!(chat_id = %self.chat_id, track_id = %track_id, attempt, identity = %identity, "Fetching");
            }
            FetchReport::Retrying { attempt, delay, .. } => {
                if let Some(track) = self.queue.get_mut(track_id) {
                    if track.status == TrackStatus::Fetching {
                        if let Err(e) = track.reset_for_retry() {
                            debug!(error = %e, "Ignoring retry");
                        }
                    }
                }
                debug!(
                    chat_id = %self.chat_id,
                    track_id = %track_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Fetch retry scheduled"
                );
            }
            FetchReport::Finished(result) => {
                self.jobs.remove(&track_id);
                match result.outcome {
                    FetchOutcome::Success(audio) => {
                        let path = audio.path.clone();
                        let marked = match self.queue.get_mut(track_id) {
                            Some(track) => track.mark_ready(audio),
                            None => Ok(()),
                        };
                        if let Err(e) = marked {
                            warn!(chat_id = %self.chat_id, error = %e, "Dropping fetched file");
                            self.ctx.temp_files().release(&path);
                        } else if self.state == PlaybackState::Loading(track_id) {
                            if let StreamStart::Failed(reason) = self.start_stream(track_id).await {
                                self.fail_head(&reason).await;
                                self.advance().await;
                            }
                        }
                    }
                    FetchOutcome::Failure(failure) => {
                        let reason = failure.to_string();
                        if self.state == PlaybackState::Loading(track_id) {
                            self.fail_head(&reason).await;
                            self.advance().await;
                        } else {
                            self.fail_queued(track_id, &reason).await;
                        }
                    }
                }
                self.retry_deferred().await;
            }
        }
    }

    async fn handle_sink_event(&mut self, event: SinkEvent) {
        let current = match &self.stream {
            Some(stream) if stream.id == event.stream_id => stream.track_id,
            _ => {
                debug!(chat_id = %self.chat_id, stream = %event.stream_id, "Ignoring event from stale stream");
                return;
            }
        };

        match event.kind {
            SinkEventKind::Completed => {
                debug!(chat_id = %self.chat_id, track_id = %current, "Stream completed");
                self.finish_head(false).await;
            }
            SinkEventKind::Error(message) => {
                warn!(chat_id = %self.chat_id, track_id = %current, error = %message, "Stream error");
                self.emit_playback(PlaybackEvent::Error {
                    chat_id: self.chat_id,
                    message: message.clone(),
                });
                self.fail_head(&format!("playback error ({})", message))
                    .await;
            }
        }
        self.advance().await;
    }

    fn on_idle_timeout(&mut self) {
        self.idle_deadline = None;
        if self.state.is_idle() && self.queue.is_empty() {
            info!(chat_id = %self.chat_id, "Idle timeout reached, requesting teardown");
            let _ = self.teardown.send(TeardownRequest {
                chat_id: self.chat_id,
                reason: TeardownReason::IdleTimeout,
            });
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        self.last_activity = Instant::now();

        match command {
            SessionCommand::Enqueue {
                user,
                source,
                media,
                reply,
            } => {
                let result = self.enqueue(user, source, media).await;
                if result.is_ok() {
                    self.persist().await;
                    self.advance().await;
                }
                let _ = reply.send(result);
            }
            SessionCommand::EnqueueMany {
                user,
                sources,
                media,
                reply,
            } => {
                let outcome = self.enqueue_many(user, sources, media).await;
                if !outcome.added.is_empty() {
                    self.persist().await;
                    self.advance().await;
                }
                let _ = reply.send(outcome);
            }
            SessionCommand::Skip {
                user,
                is_admin,
                reply,
            } => {
                let result = self.skip(user, is_admin).await;
                let _ = reply.send(result);
            }
            SessionCommand::Pause { reply } => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            SessionCommand::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            SessionCommand::Seek { position, reply } => {
                let result = self.seek(position).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetVolume { volume, reply } => {
                let result = self.set_volume(volume).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetLoopMode { mode, reply } => {
                self.queue.set_loop_mode(mode);
                self.emit_queue(QueueEvent::LoopModeChanged {
                    chat_id: self.chat_id,
                    mode: mode.to_string(),
                });
                self.persist().await;
                let _ = reply.send(());
            }
            SessionCommand::Shuffle { reply } => {
                self.queue.shuffle();
                self.emit_queue(QueueEvent::Reordered {
                    chat_id: self.chat_id,
                });
                self.persist().await;
                let _ = reply.send(self.queue.len());
            }
            SessionCommand::Remove { position, reply } => {
                let result = self.remove(position).await;
                let _ = reply.send(result);
            }
            SessionCommand::Move { from, to, reply } => {
                let result = self.queue.reorder(from, to).map_err(PlaybackError::from);
                if result.is_ok() {
                    self.emit_queue(QueueEvent::Reordered {
                        chat_id: self.chat_id,
                    });
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            SessionCommand::Stop { reply } => {
                let removed = self.stop().await;
                let _ = reply.send(removed);
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SessionCommand::QueuePage { reply } => {
                let _ = reply.send(format_queue_page(&self.queue));
            }
            SessionCommand::History { limit, reply } => {
                let _ = reply.send(self.queue.history(limit).cloned().collect());
            }
            // Both handled by the run loop.
            SessionCommand::RetireIfIdle { reply, .. } => {
                let _ = reply.send(false);
            }
            SessionCommand::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn enqueue(
        &mut self,
        user: UserId,
        source: PlayableSource,
        media: MediaKind,
    ) -> Result<Enqueued> {
        let track = self
            .queue
            .enqueue(user, source, media, self.ctx.clock.now())?;
        let position = self.queue.len();
        self.emit_queue(QueueEvent::TrackEnqueued {
            chat_id: self.chat_id,
            track_id: track.id.to_string(),
            title: track.title().to_string(),
            position,
        });

        let priority = if position == 1 {
            Priority::Interactive
        } else {
            Priority::Background
        };
        self.submit_fetch(track.id, priority).await;
        Ok(Enqueued { track, position })
    }

    async fn enqueue_many(
        &mut self,
        user: UserId,
        sources: Vec<PlayableSource>,
        media: MediaKind,
    ) -> PlaylistOutcome {
        let total = sources.len();
        let mut outcome = PlaylistOutcome::default();

        for (index, source) in sources.into_iter().enumerate() {
            match self.enqueue(user, source, media).await {
                Ok(enqueued) => outcome.added.push(enqueued.track),
                Err(PlaybackError::Queue(e)) => {
                    let stop = matches!(
                        e,
                        QueueError::QueueFull { .. } | QueueError::UserQuotaExceeded { .. }
                    );
                    outcome.first_error.get_or_insert(e);
                    if stop {
                        outcome.rejected += total - index;
                        break;
                    }
                    outcome.rejected += 1;
                }
                Err(e) => {
                    warn!(chat_id = %self.chat_id, error = %e, "Playlist entry rejected");
                    outcome.rejected += 1;
                }
            }
        }
        outcome
    }

    async fn skip(&mut self, user: UserId, is_admin: bool) -> Result<SkipOutcome> {
        let Some(track_id) = self.state.track_id() else {
            return Err(PlaybackError::NothingPlaying);
        };
        let (title, requested_by) = match self.queue.head() {
            Some(head) if head.id == track_id => (head.title().to_string(), head.requested_by),
            _ => return Err(PlaybackError::NothingPlaying),
        };

        let direct =
            !self.ctx.config.enable_voting_system || is_admin || requested_by == user;
        if !direct {
            let listeners = match self.ctx.notifier.listener_count(self.chat_id).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(chat_id = %self.chat_id, error = %e, "Listener count unavailable");
                    1
                }
            };
            let required = self.ctx.config.vote_threshold.required_votes(listeners);

            if !self.votes.add(user) {
                return Ok(SkipOutcome::AlreadyVoted {
                    votes: self.votes.count(),
                    required,
                });
            }

            let votes = self.votes.count();
            self.emit_playback(PlaybackEvent::VoteRegistered {
                chat_id: self.chat_id,
                track_id: track_id.to_string(),
                votes,
                required,
            });
            if votes < required {
                debug!(chat_id = %self.chat_id, votes, required, "Skip vote registered");
                return Ok(SkipOutcome::VoteRegistered { votes, required });
            }
        }

        info!(chat_id = %self.chat_id, track_id = %track_id, user_id = %user, "Skipping track");
        self.finish_head(true).await;
        self.advance().await;
        Ok(SkipOutcome::Skipped { title })
    }

    fn require_track(&self) -> Result<TrackId> {
        match self.state {
            PlaybackState::Idle | PlaybackState::Finishing(_) => Err(PlaybackError::NothingPlaying),
            PlaybackState::Loading(_) => Err(PlaybackError::StillLoading),
            PlaybackState::Playing(id) | PlaybackState::Paused(id) => Ok(id),
        }
    }

    async fn pause(&mut self) -> Result<Duration> {
        let track_id = self.require_track()?;
        if matches!(self.state, PlaybackState::Paused(_)) {
            return Err(PlaybackError::AlreadyPaused);
        }
        if let Some(stream) = &self.stream {
            stream.session.pause().await?;
        }
        self.anchor.pause();
        self.set_state(PlaybackState::Paused(track_id));
        let position = self.anchor.position();
        self.emit_playback(PlaybackEvent::Paused {
            chat_id: self.chat_id,
            track_id: track_id.to_string(),
            position_ms: position.as_millis() as u64,
        });
        self.persist().await;
        Ok(position)
    }

    async fn resume(&mut self) -> Result<Duration> {
        let track_id = self.require_track()?;
        if !matches!(self.state, PlaybackState::Paused(_)) {
            return Err(PlaybackError::NotPaused);
        }
        if let Some(stream) = &self.stream {
            stream.session.resume().await?;
        }
        self.anchor.resume();
        self.set_state(PlaybackState::Playing(track_id));
        let position = self.anchor.position();
        self.emit_playback(PlaybackEvent::Resumed {
            chat_id: self.chat_id,
            track_id: track_id.to_string(),
            position_ms: position.as_millis() as u64,
        });
        Ok(position)
    }

    async fn seek(&mut self, position: Duration) -> Result<Duration> {
        let track_id = self.require_track()?;
        let (live, duration) = match self.queue.head() {
            Some(head) => (head.is_live(), head.duration_seconds()),
            None => return Err(PlaybackError::NothingPlaying),
        };
        if live {
            return Err(PlaybackError::SeekNotSupported);
        }
        let duration = Duration::from_secs(duration);
        if !duration.is_zero() && position >= duration {
            return Err(PlaybackError::SeekOutOfBounds { position, duration });
        }

        if let Some(stream) = &self.stream {
            stream.session.seek(position).await?;
        }
        self.anchor.seek(position);
        self.emit_playback(PlaybackEvent::Seeked {
            chat_id: self.chat_id,
            track_id: track_id.to_string(),
            position_ms: position.as_millis() as u64,
        });
        self.persist().await;
        Ok(position)
    }

    async fn set_volume(&mut self, volume: u16) -> Result<u16> {
        let volume = volume.min(MAX_VOLUME);
        if let Some(stream) = &self.stream {
            stream.session.set_volume(volume).await?;
        }
        self.volume = volume;
        self.emit_playback(PlaybackEvent::VolumeChanged {
            chat_id: self.chat_id,
            volume,
        });
        self.persist().await;
        Ok(volume)
    }

    async fn remove(&mut self, position: usize) -> Result<Removed> {
        match self.queue.remove(position)? {
            RemoveOutcome::SkipCurrent => {
                let title = self
                    .queue
                    .head()
                    .map(|t| t.title().to_string())
                    .unwrap_or_default();
                self.finish_head(true).await;
                self.advance().await;
                Ok(Removed::SkippedCurrent { title })
            }
            RemoveOutcome::Removed(track) => {
                self.cancel_job(track.id);
                self.release_audio(&track);
                self.emit_queue(QueueEvent::TrackRemoved {
                    chat_id: self.chat_id,
                    track_id: track.id.to_string(),
                });
                self.persist().await;
                self.advance().await;
                Ok(Removed::Track(track))
            }
        }
    }

    async fn stop(&mut self) -> usize {
        self.close_stream().await;
        for (_, token) in self.jobs.drain() {
            token.cancel();
        }
        self.deferred.clear();

        let removed = self.queue.drain_all();
        for track in &removed {
            self.release_audio(track);
        }
        if !self.state.is_idle() {
            self.set_state(PlaybackState::Idle);
        }
        self.anchor.reset();
        self.votes.clear();
        self.resume_at = None;

        info!(chat_id = %self.chat_id, removed = removed.len(), "Playback stopped");
        self.emit_queue(QueueEvent::Cleared {
            chat_id: self.chat_id,
            removed: removed.len(),
        });
        self.persist().await;
        self.enter_idle();
        removed.len()
    }

    fn status(&self) -> SessionStatus {
        let now_playing = match self.state {
            PlaybackState::Playing(id) | PlaybackState::Paused(id) => {
                self.queue.get(id).map(|track| NowPlaying {
                    track: track.clone(),
                    position: self.anchor.position(),
                    paused: matches!(self.state, PlaybackState::Paused(_)),
                })
            }
            _ => None,
        };
        SessionStatus {
            chat_id: self.chat_id,
            state: self.state,
            now_playing,
            volume: self.volume,
            loop_mode: self.queue.loop_mode(),
            queue_len: self.queue.len(),
        }
    }

    fn try_retire(&mut self) -> bool {
        if self.fatal {
            return true;
        }
        let idle = self.state.is_idle() && self.queue.is_empty();
        let delay = self.ctx.config.auto_leave_delay;
        let quiet = self.last_activity.elapsed() >= delay;
        if idle && !quiet {
            self.idle_deadline = Some(self.last_activity + delay);
        }
        idle && quiet
    }

    async fn teardown(&mut self, reason: &str, forget: bool) {
        info!(chat_id = %self.chat_id, reason, forget, "Tearing down session");
        if !forget {
            self.persist().await;
        }
        self.cancel.cancel();
        self.jobs.clear();
        self.deferred.clear();
        self.close_stream().await;

        if let Err(e) = self.ctx.sink.leave(self.chat_id).await {
            warn!(chat_id = %self.chat_id, error = %e, "Failed to leave voice chat");
        }
        self.ctx.temp_files().release_session(self.chat_id);
        if forget {
            if let Err(e) = self.ctx.store.delete_session_snapshot(self.chat_id).await {
                warn!(chat_id = %self.chat_id, error = %e, "Failed to delete session snapshot");
            }
        }
    }
}
