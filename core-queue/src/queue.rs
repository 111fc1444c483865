//! # Session Queue Manager
//!
//! Ordered queue of [`Track`]s for one chat. The manager enforces the queue
//! limits, the per-user quota and the loop-mode policy. It is a plain owned
//! value: the session actor that owns it is what serializes access.
//!
//! ## Head pinning
//!
//! While the head track is loading or playing, the playback controller pins
//! it. A pinned head cannot be removed (removal is turned into a skip),
//! moved, or shuffled; reorder and shuffle only touch positions 2 and up.
//!
//! ## Usage
//!
//! ```
//! use bridge_traits::{ChatId, MediaKind, PlayableSource, Provider, UserId};
//! use chrono::Utc;
//! use core_queue::{QueueLimits, SessionQueue};
//!
//! let mut queue = SessionQueue::new(ChatId::new(-100), QueueLimits::default());
//! let source = PlayableSource::new(Provider::Youtube, "yt:abc", "Song", 200);
//! let track = queue
//!     .enqueue(UserId::new(1), source, MediaKind::Audio, Utc::now())
//!     .unwrap();
//!
//! assert_eq!(queue.position_of(track.id), Some(1));
//! ```

use bridge_traits::{ChatId, MediaKind, PlayableSource, UserId};
use chrono::{DateTime, Utc};
use core_runtime::EngineConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::track::{Track, TrackId, TrackStatus};

/// Played tracks kept for the history command.
pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Completed tracks are discarded.
    #[default]
    None,
    /// The completed track is replayed at the head.
    Track,
    /// The completed track is appended at the tail.
    Queue,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::None => "none",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "0" => Ok(LoopMode::None),
            "track" | "single" | "one" | "1" => Ok(LoopMode::Track),
            "queue" | "all" | "2" => Ok(LoopMode::Queue),
            other => Err(QueueError::InvalidLoopMode(other.to_string())),
        }
    }
}

/// Admission limits for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_queue_length: usize,
    pub max_user_queue: usize,
    pub max_duration: Duration,
    pub enable_live_streams: bool,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for QueueLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_queue_length: config.max_queue_length,
            max_user_queue: config.max_user_queue,
            max_duration: config.max_duration,
            enable_live_streams: config.enable_live_streams,
        }
    }
}

/// Result of a remove-by-position request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(Track),
    /// The position named the pinned head; the caller should skip instead.
    SkipCurrent,
}

/// Ordered queue of one session.
#[derive(Debug, Clone)]
pub struct SessionQueue {
    chat_id: ChatId,
    limits: QueueLimits,
    tracks: VecDeque<Track>,
    loop_mode: LoopMode,
    pinned: Option<TrackId>,
    history: VecDeque<Track>,
}

impl SessionQueue {
    pub fn new(chat_id: ChatId, limits: QueueLimits) -> Self {
        Self {
            chat_id,
            limits,
            tracks: VecDeque::new(),
            loop_mode: LoopMode::None,
            pinned: None,
            history: VecDeque::new(),
        }
    }

    /// Rebuild a queue from persisted tracks. Limits are not re-checked so a
    /// lowered limit never drops stored tracks.
    pub fn restore(
        chat_id: ChatId,
        limits: QueueLimits,
        loop_mode: LoopMode,
        tracks: impl IntoIterator<Item = Track>,
    ) -> Self {
        let mut queue = Self::new(chat_id, limits);
        queue.loop_mode = loop_mode;
        queue.tracks = tracks.into_iter().collect();
        queue
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn head(&self) -> Option<&Track> {
        self.tracks.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Track> {
        self.tracks.front_mut()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// 1-based position of a track.
    pub fn position_of(&self, id: TrackId) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == id).map(|i| i + 1)
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        debug!(chat_id = %self.chat_id, mode = %mode, "Loop mode set");
        self.loop_mode = mode;
    }

    /// Tracks in the queue requested by `user`.
    pub fn user_queued_count(&self, user: UserId) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.requested_by == user && !t.status.is_terminal())
            .count()
    }

    /// Append a new track after checking source and quota limits.
    pub fn enqueue(
        &mut self,
        user: UserId,
        source: PlayableSource,
        media: MediaKind,
        now: DateTime<Utc>,
    ) -> Result<Track> {
        if source.is_live {
            if !self.limits.enable_live_streams {
                return Err(QueueError::LiveStreamsDisabled);
            }
        } else if source.duration_seconds > self.limits.max_duration.as_secs() {
            return Err(QueueError::DurationExceeded {
                duration: source.duration_seconds,
                max: self.limits.max_duration.as_secs(),
            });
        }

        if self.tracks.len() >= self.limits.max_queue_length {
            return Err(QueueError::QueueFull {
                max: self.limits.max_queue_length,
            });
        }

        if self.user_queued_count(user) >= self.limits.max_user_queue {
            return Err(QueueError::UserQuotaExceeded {
                user,
                max: self.limits.max_user_queue,
            });
        }

        let track = Track::new(source, media, user, now);
        debug!(
            chat_id = %self.chat_id,
            track_id = %track.id,
            user_id = %user,
            position = self.tracks.len() + 1,
            "Track enqueued"
        );
        self.tracks.push_back(track.clone());
        Ok(track)
    }

    /// Pin the current head. Returns its id, if any.
    pub fn pin_head(&mut self) -> Option<TrackId> {
        self.pinned = self.tracks.front().map(|t| t.id);
        self.pinned
    }

    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    pub fn is_head_pinned(&self) -> bool {
        match (self.pinned, self.tracks.front()) {
            (Some(pinned), Some(head)) => pinned == head.id,
            _ => false,
        }
    }

    /// Index of the first track that may be moved.
    fn first_movable(&self) -> usize {
        if self.is_head_pinned() {
            1
        } else {
            0
        }
    }

    fn check_position(&self, position: usize) -> Result<usize> {
        if position == 0 || position > self.tracks.len() {
            return Err(QueueError::PositionOutOfRange {
                position,
                len: self.tracks.len(),
            });
        }
        Ok(position - 1)
    }

    /// Remove the track at 1-based `position`.
    pub fn remove(&mut self, position: usize) -> Result<RemoveOutcome> {
        let index = self.check_position(position)?;
        if index < self.first_movable() {
            return Ok(RemoveOutcome::SkipCurrent);
        }

        match self.tracks.remove(index) {
            Some(track) => {
                debug!(chat_id = %self.chat_id, track_id = %track.id, position, "Track removed");
                Ok(RemoveOutcome::Removed(track))
            }
            None => Err(QueueError::PositionOutOfRange {
                position,
                len: self.tracks.len(),
            }),
        }
    }

    /// Remove a specific track, wherever it is. The pinned head is not removable.
    pub fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let index = self.tracks.iter().position(|t| t.id == id)?;
        if index < self.first_movable() {
            return None;
        }
        self.tracks.remove(index)
    }

    /// Move the track at `from` so that it ends up at `to` (both 1-based).
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        let from_idx = self.check_position(from)?;
        let to_idx = self.check_position(to)?;
        let first = self.first_movable();
        if from_idx < first {
            return Err(QueueError::PinnedTrack { position: from });
        }
        if to_idx < first {
            return Err(QueueError::PinnedTrack { position: to });
        }
        if from_idx == to_idx {
            return Ok(());
        }

        if let Some(track) = self.tracks.remove(from_idx) {
            self.tracks.insert(to_idx, track);
        }
        debug!(chat_id = %self.chat_id, from, to, "Queue reordered");
        Ok(())
    }

    /// Shuffle everything behind the pinned head.
    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut rand::thread_rng());
    }

    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let first = self.first_movable();
        let slice = self.tracks.make_contiguous();
        if slice.len() > first + 1 {
            slice[first..].shuffle(rng);
        }
    }

    /// Pop the finished head and apply the loop policy.
    ///
    /// Played tracks go to history and, depending on the loop mode, a replay
    /// is put back at the head or the tail. Failed tracks never loop.
    /// Returns the finished track and, if one was queued, its replay.
    pub fn complete_head(&mut self, now: DateTime<Utc>) -> Option<(Track, Option<Track>)> {
        self.pop_head(now, self.loop_mode)
    }

    /// Like [`complete_head`](Self::complete_head), but a skipped track is
    /// never replayed in place: `LoopMode::Track` behaves as `None`.
    pub fn skip_head(&mut self, now: DateTime<Utc>) -> Option<(Track, Option<Track>)> {
        let mode = match self.loop_mode {
            LoopMode::Track => LoopMode::None,
            other => other,
        };
        self.pop_head(now, mode)
    }

    fn pop_head(&mut self, now: DateTime<Utc>, mode: LoopMode) -> Option<(Track, Option<Track>)> {
        let finished = self.tracks.pop_front()?;
        self.pinned = None;

        if finished.status != TrackStatus::Played {
            return Some((finished, None));
        }

        let replay = match mode {
            LoopMode::None => None,
            LoopMode::Track => {
                let replay = finished.replay(now);
                self.tracks.push_front(replay.clone());
                Some(replay)
            }
            LoopMode::Queue => {
                let replay = finished.replay(now);
                self.tracks.push_back(replay.clone());
                Some(replay)
            }
        };

        self.history.push_front(finished.clone());
        self.history.truncate(HISTORY_CAPACITY);
        Some((finished, replay))
    }

    /// Drop every track, pinned or not.
    pub fn drain_all(&mut self) -> Vec<Track> {
        self.pinned = None;
        self.tracks.drain(..).collect()
    }

    /// Most recently played tracks, newest first.
    pub fn history(&self, limit: usize) -> impl Iterator<Item = &Track> {
        self.history.iter().take(limit)
    }
}
