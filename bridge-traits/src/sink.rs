//! Voice Streaming Sink
//!
//! The voice transport joins the group call and plays a local file. It
//! reports completion and errors asynchronously through an event channel
//! handed over when the stream is opened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ids::ChatId;
use crate::resolver::MediaKind;

/// Local, transcoded file ready to be streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioHandle {
    pub path: PathBuf,
    pub media: MediaKind,
    pub duration_seconds: Option<u64>,
}

impl AudioHandle {
    pub fn new(path: impl Into<PathBuf>, media: MediaKind) -> Self {
        Self {
            path: path.into(),
            media,
            duration_seconds: None,
        }
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }
}

/// Identifies one opened stream so late events from a closed one can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub stream_id: StreamId,
    /// 0 to 200, 100 is unity gain.
    pub volume: u16,
    pub start_at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEventKind {
    Completed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEvent {
    pub stream_id: StreamId,
    pub kind: SinkEventKind,
}

impl SinkEvent {
    pub fn completed(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: SinkEventKind::Completed,
        }
    }

    pub fn error(stream_id: StreamId, message: impl Into<String>) -> Self {
        Self {
            stream_id,
            kind: SinkEventKind::Error(message.into()),
        }
    }
}

pub type SinkEventSender = mpsc::UnboundedSender<SinkEvent>;
pub type SinkEventReceiver = mpsc::UnboundedReceiver<SinkEvent>;

/// Handle to a stream that is currently playing into a call.
#[async_trait]
pub trait StreamSession: Send + Sync {
    async fn set_volume(&self, volume: u16) -> Result<()>;

    async fn seek(&self, position: Duration) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Stop streaming. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait StreamingSink: Send + Sync {
    async fn open_stream(
        &self,
        chat_id: ChatId,
        audio: &AudioHandle,
        options: StreamOptions,
        events: SinkEventSender,
    ) -> Result<Box<dyn StreamSession>>;

    /// Leave the voice call of a chat.
    async fn leave(&self, chat_id: ChatId) -> Result<()>;
}
