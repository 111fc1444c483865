use bridge_traits::UserId;
use thiserror::Error;

/// Queue errors. The `Display` text is what the requesting user sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("The queue is full ({max} tracks maximum)")]
    QueueFull { max: usize },

    #[error("You already have {max} tracks queued")]
    UserQuotaExceeded { user: UserId, max: usize },

    #[error("Track is too long ({duration}s, limit is {max}s)")]
    DurationExceeded { duration: u64, max: u64 },

    #[error("Live streams are disabled")]
    LiveStreamsDisabled,

    #[error("No track at position {position} (queue has {len})")]
    PositionOutOfRange { position: usize, len: usize },

    #[error("The track at position {position} is playing and cannot be moved")]
    PinnedTrack { position: usize },

    #[error("Track not found: {track_id}")]
    TrackNotFound { track_id: String },

    #[error("Invalid track state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Unknown loop mode '{0}', use none, track or queue")]
    InvalidLoopMode(String),

    #[error("Invalid time '{0}', use seconds, MM:SS, HH:MM:SS or 90s/5m/1h")]
    InvalidTime(String),

    #[error("Invalid track id: {0}")]
    InvalidTrackId(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl QueueError {
    /// Errors caused by what the user asked for rather than by the engine.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            QueueError::InvalidStateTransition { .. } | QueueError::Snapshot(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
