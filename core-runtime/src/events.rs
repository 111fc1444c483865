//! # Event Bus
//!
//! Broadcast channel that lets the registry, the session actors, the fetch
//! pool and the egress pool publish what they do without knowing who listens.
//! Host bots use it for dashboards; tests use it to wait for state changes.
//!
//! ## Usage
//!
//! ```rust
//! use bridge_traits::ChatId;
//! use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
//!
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Session(SessionEvent::Created {
//!     chat_id: ChatId::new(-100),
//! }))
//! .ok();
//!
//! assert!(matches!(rx.try_recv(), Ok(CoreEvent::Session(_))));
//! ```
//!
//! Emission is best-effort: `emit` fails only when nobody is subscribed, and
//! callers ignore that.

use bridge_traits::ChatId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError, error::SendError, Receiver};

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Session(SessionEvent),
    Queue(QueueEvent),
    Fetch(FetchEvent),
    Egress(EgressEvent),
    Playback(PlaybackEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Session(e) => e.description(),
            CoreEvent::Queue(e) => e.description(),
            CoreEvent::Fetch(e) => e.description(),
            CoreEvent::Egress(e) => e.description(),
            CoreEvent::Playback(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Fetch(FetchEvent::Failed { .. }) => EventSeverity::Warning,
            CoreEvent::Egress(EgressEvent::IdentityDisabled { .. }) => EventSeverity::Warning,
            CoreEvent::Egress(EgressEvent::Exhausted) => EventSeverity::Error,
            CoreEvent::Playback(PlaybackEvent::TrackFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Playback(PlaybackEvent::Error { .. }) => EventSeverity::Error,
            CoreEvent::Session(_) => EventSeverity::Info,
            CoreEvent::Playback(PlaybackEvent::Started { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Chat the event belongs to, if it is session scoped.
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            CoreEvent::Session(e) => Some(e.chat_id()),
            CoreEvent::Queue(e) => Some(e.chat_id()),
            CoreEvent::Fetch(e) => Some(e.chat_id()),
            CoreEvent::Playback(e) => Some(e.chat_id()),
            CoreEvent::Egress(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Session Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SessionEvent {
    Created { chat_id: ChatId },
    /// Session rebuilt from a stored snapshot at startup.
    Restored { chat_id: ChatId, tracks: usize },
    Destroyed { chat_id: ChatId, reason: String },
}

impl SessionEvent {
    fn description(&self) -> &str {
        match self {
            SessionEvent::Created { .. } => "Session created",
            SessionEvent::Restored { .. } => "Session restored",
            SessionEvent::Destroyed { .. } => "Session destroyed",
        }
    }

    fn chat_id(&self) -> ChatId {
        match self {
            SessionEvent::Created { chat_id }
            | SessionEvent::Restored { chat_id, .. }
            | SessionEvent::Destroyed { chat_id, .. } => *chat_id,
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    TrackEnqueued {
        chat_id: ChatId,
        track_id: String,
        title: String,
        /// 1-based position in the queue.
        position: usize,
    },
    TrackRemoved {
        chat_id: ChatId,
        track_id: String,
    },
    Reordered {
        chat_id: ChatId,
    },
    Cleared {
        chat_id: ChatId,
        removed: usize,
    },
    LoopModeChanged {
        chat_id: ChatId,
        mode: String,
    },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::TrackEnqueued { .. } => "Track enqueued",
            QueueEvent::TrackRemoved { .. } => "Track removed",
            QueueEvent::Reordered { .. } => "Queue reordered",
            QueueEvent::Cleared { .. } => "Queue cleared",
            QueueEvent::LoopModeChanged { .. } => "Loop mode changed",
        }
    }

    fn chat_id(&self) -> ChatId {
        match self {
            QueueEvent::TrackEnqueued { chat_id, .. }
            | QueueEvent::TrackRemoved { chat_id, .. }
            | QueueEvent::Reordered { chat_id }
            | QueueEvent::Cleared { chat_id, .. }
            | QueueEvent::LoopModeChanged { chat_id, .. } => *chat_id,
        }
    }
}

// ============================================================================
// Fetch Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FetchEvent {
    Started {
        chat_id: ChatId,
        track_id: String,
        attempt: u32,
        route: String,
    },
    Retrying {
        chat_id: ChatId,
        track_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    Completed {
        chat_id: ChatId,
        track_id: String,
    },
    Failed {
        chat_id: ChatId,
        track_id: String,
        reason: String,
    },
    /// Result thrown away because the session or track went away.
    Discarded {
        chat_id: ChatId,
        track_id: String,
    },
}

impl FetchEvent {
    fn description(&self) -> &str {
        match self {
            FetchEvent::Started { .. } => "Fetch started",
            FetchEvent::Retrying { .. } => "Fetch retry scheduled",
            FetchEvent::Completed { .. } => "Fetch completed",
            FetchEvent::Failed { .. } => "Fetch failed",
            FetchEvent::Discarded { .. } => "Fetch discarded",
        }
    }

    fn chat_id(&self) -> ChatId {
        match self {
            FetchEvent::Started { chat_id, .. }
            | FetchEvent::Retrying { chat_id, .. }
            | FetchEvent::Completed { chat_id, .. }
            | FetchEvent::Failed { chat_id, .. }
            | FetchEvent::Discarded { chat_id, .. } => *chat_id,
        }
    }
}

// ============================================================================
// Egress Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum EgressEvent {
    IdentityDisabled {
        identity_id: String,
        /// Unix seconds when the identity becomes eligible again.
        until: i64,
    },
    IdentityReadmitted {
        identity_id: String,
    },
    /// An acquire found no eligible identity.
    Exhausted,
}

impl EgressEvent {
    fn description(&self) -> &str {
        match self {
            EgressEvent::IdentityDisabled { .. } => "Egress identity disabled",
            EgressEvent::IdentityReadmitted { .. } => "Egress identity re-admitted",
            EgressEvent::Exhausted => "No eligible egress identity",
        }
    }
}

// ============================================================================
// Playback Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    Loading {
        chat_id: ChatId,
        track_id: String,
    },
    Started {
        chat_id: ChatId,
        track_id: String,
        title: String,
    },
    Paused {
        chat_id: ChatId,
        track_id: String,
        position_ms: u64,
    },
    Resumed {
        chat_id: ChatId,
        track_id: String,
        position_ms: u64,
    },
    Seeked {
        chat_id: ChatId,
        track_id: String,
        position_ms: u64,
    },
    VolumeChanged {
        chat_id: ChatId,
        volume: u16,
    },
    VoteRegistered {
        chat_id: ChatId,
        track_id: String,
        votes: usize,
        required: usize,
    },
    /// Track finished, either naturally or by skip.
    Finished {
        chat_id: ChatId,
        track_id: String,
        skipped: bool,
    },
    TrackFailed {
        chat_id: ChatId,
        track_id: String,
        reason: String,
    },
    Idle {
        chat_id: ChatId,
    },
    Error {
        chat_id: ChatId,
        message: String,
    },
}

impl PlaybackEvent {
    fn description(&self) -> &str {
        match self {
            PlaybackEvent::Loading { .. } => "Loading track",
            PlaybackEvent::Started { .. } => "Playback started",
            PlaybackEvent::Paused { .. } => "Playback paused",
            PlaybackEvent::Resumed { .. } => "Playback resumed",
            PlaybackEvent::Seeked { .. } => "Playback position changed",
            PlaybackEvent::VolumeChanged { .. } => "Volume changed",
            PlaybackEvent::VoteRegistered { .. } => "Skip vote registered",
            PlaybackEvent::Finished { .. } => "Track finished",
            PlaybackEvent::TrackFailed { .. } => "Track failed",
            PlaybackEvent::Idle { .. } => "Playback idle",
            PlaybackEvent::Error { .. } => "Playback error",
        }
    }

    fn chat_id(&self) -> ChatId {
        match self {
            PlaybackEvent::Loading { chat_id, .. }
            | PlaybackEvent::Started { chat_id, .. }
            | PlaybackEvent::Paused { chat_id, .. }
            | PlaybackEvent::Resumed { chat_id, .. }
            | PlaybackEvent::Seeked { chat_id, .. }
            | PlaybackEvent::VolumeChanged { chat_id, .. }
            | PlaybackEvent::VoteRegistered { chat_id, .. }
            | PlaybackEvent::Finished { chat_id, .. }
            | PlaybackEvent::TrackFailed { chat_id, .. }
            | PlaybackEvent::Idle { chat_id }
            | PlaybackEvent::Error { chat_id, .. } => *chat_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer; slower subscribers observe
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers reached, or an error when there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver with an optional predicate, e.g. events of a single chat.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Only events scoped to `chat_id`.
    pub fn for_chat(self, chat_id: ChatId) -> Self {
        self.filter(move |event| event.chat_id() == Some(chat_id))
    }

    /// Next event passing the filter. Lagging is skipped over rather than
    /// reported, since filtered consumers only care about what comes next.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = match self.receiver.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(RecvError::Closed),
            };

            match &self.filter {
                Some(filter) if !filter(&event) => continue,
                _ => return Ok(event),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
