//! # Session Snapshots
//!
//! Serialized form of a session handed to the [`SnapshotStore`]. Only what
//! is needed to rebuild the queue is kept: fetch progress and local files are
//! not, so every restored track starts again as `Queued` and the head
//! resumes at the saved position once it is fetched.
//!
//! [`SnapshotStore`]: bridge_traits::SnapshotStore

use bridge_traits::{ChatId, MediaKind, PlayableSource, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::queue::{LoopMode, QueueLimits, SessionQueue};
use crate::track::{Track, TrackId, TrackStatus};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub source: PlayableSource,
    pub media: MediaKind,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl From<&Track> for TrackSnapshot {
    fn from(track: &Track) -> Self {
        Self {
            id: track.id,
            source: track.source.clone(),
            media: track.media,
            requested_by: track.requested_by,
            added_at: track.added_at,
        }
    }
}

impl TrackSnapshot {
    fn into_track(self) -> Track {
        Track {
            id: self.id,
            source: self.source,
            media: self.media,
            requested_by: self.requested_by,
            added_at: self.added_at,
            status: TrackStatus::Queued,
            attempt: 0,
            audio: None,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub chat_id: ChatId,
    pub tracks: Vec<TrackSnapshot>,
    #[serde(default)]
    pub loop_mode: LoopMode,
    pub volume: u16,
    /// Playback position of the head track.
    #[serde(default)]
    pub position_ms: u64,
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Capture the queue. Terminal tracks are left out.
    pub fn capture(
        queue: &SessionQueue,
        volume: u16,
        position_ms: u64,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            chat_id: queue.chat_id(),
            tracks: queue
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(TrackSnapshot::from)
                .collect(),
            loop_mode: queue.loop_mode(),
            volume,
            position_ms,
            saved_at,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| QueueError::Snapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| QueueError::Snapshot(e.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(QueueError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Rebuild the queue with every track back in `Queued`.
    pub fn restore(self, limits: QueueLimits) -> SessionQueue {
        SessionQueue::restore(
            self.chat_id,
            limits,
            self.loop_mode,
            self.tracks.into_iter().map(TrackSnapshot::into_track),
        )
    }
}
