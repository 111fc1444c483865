//! Playback state, position tracking and the vote-skip tally.
//!
//! ```text
//! Idle ──> Loading ──> Playing ⇄ Paused
//!  ^          │           │        │
//!  │          └───────────┴────────┴──> Finishing ──> Loading | Idle
//!  └───────────────────────────────────────────────────────────┘
//! ```

use bridge_traits::UserId;
use core_queue::TrackId;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PlaybackError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "track_id", rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    /// Waiting for the head track's file.
    Loading(TrackId),
    Playing(TrackId),
    Paused(TrackId),
    /// Loop policy and head advance in progress.
    Finishing(TrackId),
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading(_) => "loading",
            PlaybackState::Playing(_) => "playing",
            PlaybackState::Paused(_) => "paused",
            PlaybackState::Finishing(_) => "finishing",
        }
    }

    pub fn track_id(&self) -> Option<TrackId> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Loading(id)
            | PlaybackState::Playing(id)
            | PlaybackState::Paused(id)
            | PlaybackState::Finishing(id) => Some(*id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, PlaybackState::Idle)
    }

    /// A stream is open (playing or paused).
    pub fn is_streaming(&self) -> bool {
        matches!(self, PlaybackState::Playing(_) | PlaybackState::Paused(_))
    }

    fn allows(&self, to: &PlaybackState) -> bool {
        use PlaybackState::*;
        matches!(
            (self, to),
            (Idle, Loading(_))
                | (Loading(_), Playing(_))
                | (Loading(_), Finishing(_))
                | (Loading(_), Idle)
                | (Playing(_), Paused(_))
                | (Playing(_), Finishing(_))
                | (Paused(_), Playing(_))
                | (Paused(_), Finishing(_))
                | (Finishing(_), Loading(_))
                | (Finishing(_), Idle)
                | (Playing(_), Idle)
                | (Paused(_), Idle)
        )
    }

    /// Move to `to` if the transition is one of the enumerated ones.
    pub fn transition(&mut self, to: PlaybackState) -> Result<()> {
        if !self.allows(&to) {
            return Err(PlaybackError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
                reason: "transition not allowed".to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Playback position derived from the last known offset and a start instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionAnchor {
    offset: Duration,
    running_since: Option<Instant>,
}

impl PositionAnchor {
    pub fn start(&mut self, at: Duration) {
        self.offset = at;
        self.running_since = Some(Instant::now());
    }

    pub fn pause(&mut self) {
        self.offset = self.position();
        self.running_since = None;
    }

    pub fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Re-anchor at `to`, keeping the running/paused state.
    pub fn seek(&mut self, to: Duration) {
        self.offset = to;
        if self.running_since.is_some() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn position(&self) -> Duration {
        match self.running_since {
            Some(since) => self.offset + since.elapsed(),
            None => self.offset,
        }
    }
}

/// Distinct skip votes for the current track.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    voters: HashSet<UserId>,
}

impl VoteTally {
    /// Record a vote. Returns `false` if the user already voted.
    pub fn add(&mut self, user: UserId) -> bool {
        self.voters.insert(user)
    }

    pub fn count(&self) -> usize {
        self.voters.len()
    }

    pub fn clear(&mut self) {
        self.voters.clear();
    }
}
