//! # Track Model
//!
//! A [`Track`] is one queued item of a session, with its provenance and a
//! status that only moves forward:
//!
//! ```text
//! Queued ──> Fetching ──> Ready ──> Playing ──> Played
//!   │  ^        │           │          │
//!   │  └────────┘ retry     │          │
//!   └───────────────────────┴──────────┴──────> Failed
//! ```
//!
//! Two explicit resets exist: a fetch retry (`Fetching -> Queued`, with
//! `attempt += 1`) and a refetch of a ready track whose file was swept
//! before it reached the head (`Ready -> Queued`). A loop replay is created
//! directly in `Ready` when it reuses its predecessor's file; every other
//! track reaches `Ready` through `Fetching`.

use bridge_traits::{AudioHandle, MediaKind, PlayableSource, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Type-safe track identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(Uuid);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| QueueError::InvalidTrackId(e.to_string()))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Queued,
    Fetching,
    Ready,
    Playing,
    Played,
    Failed,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Played => "played",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Played | Self::Failed)
    }

    /// Waiting to be played.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Fetching | Self::Ready)
    }

    fn allows(&self, to: TrackStatus) -> bool {
        use TrackStatus::*;
        matches!(
            (self, to),
            (Queued, Fetching)
                | (Queued, Failed)
                | (Fetching, Queued)
                | (Fetching, Ready)
                | (Fetching, Failed)
                | (Ready, Queued)
                | (Ready, Playing)
                | (Ready, Failed)
                | (Playing, Played)
                | (Playing, Failed)
        )
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "fetching" => Ok(Self::Fetching),
            "ready" => Ok(Self::Ready),
            "playing" => Ok(Self::Playing),
            "played" => Ok(Self::Played),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidStateTransition {
                from: other.to_string(),
                to: other.to_string(),
                reason: "unknown track status".to_string(),
            }),
        }
    }
}

/// One entry of a session queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub source: PlayableSource,
    pub media: MediaKind,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
    pub status: TrackStatus,
    /// Number of fetch attempts that have already failed.
    pub attempt: u32,
    /// Local file once the track is `Ready`.
    pub audio: Option<AudioHandle>,
    pub failure: Option<String>,
}

impl Track {
    pub fn new(
        source: PlayableSource,
        media: MediaKind,
        requested_by: UserId,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TrackId::new(),
            source,
            media,
            requested_by,
            added_at,
            status: TrackStatus::Queued,
            attempt: 0,
            audio: None,
            failure: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.source.title
    }

    pub fn is_live(&self) -> bool {
        self.source.is_live
    }

    /// Duration in seconds, from the downloaded file when the resolver did not know it.
    pub fn duration_seconds(&self) -> u64 {
        if self.source.duration_seconds > 0 {
            return self.source.duration_seconds;
        }
        self.audio
            .as_ref()
            .and_then(|a| a.duration_seconds)
            .unwrap_or(0)
    }

    fn transition(&mut self, to: TrackStatus, reason: &str) -> Result<()> {
        if !self.status.allows(to) {
            return Err(QueueError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: reason.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// A worker picked up the fetch job.
    pub fn start_fetch(&mut self) -> Result<()> {
        self.transition(TrackStatus::Fetching, "fetch can only start from queued")
    }

    /// The fetch failed transiently and a new attempt was scheduled.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.status == TrackStatus::Queued {
            self.attempt += 1;
            return Ok(());
        }
        self.transition(TrackStatus::Queued, "only fetching or ready tracks can be retried")?;
        self.attempt += 1;
        self.audio = None;
        Ok(())
    }

    pub fn mark_ready(&mut self, audio: AudioHandle) -> Result<()> {
        self.transition(TrackStatus::Ready, "track already past fetching")?;
        self.audio = Some(audio);
        Ok(())
    }

    pub fn start_playing(&mut self) -> Result<()> {
        self.transition(TrackStatus::Playing, "only ready tracks can play")
    }

    pub fn finish(&mut self) -> Result<()> {
        self.transition(TrackStatus::Played, "only playing tracks can finish")
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TrackStatus::Failed, "track already finished")?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Copy used by loop modes: same source and requester, fresh identity.
    /// The audio file is carried over so the replay needs no refetch.
    pub fn replay(&self, now: DateTime<Utc>) -> Track {
        let mut replay = Track::new(self.source.clone(), self.media, self.requested_by, now);
        if let Some(audio) = &self.audio {
            replay.audio = Some(audio.clone());
            replay.status = TrackStatus::Ready;
        }
        replay
    }
}
