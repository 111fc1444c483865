//! # Playback Error Types
//!
//! Errors returned by session commands. The `Display` text of user-facing
//! variants is sent back to the chat as is.

use core_fetch::FetchError;
use core_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaybackError {
    // ========================================================================
    // Control Errors
    // ========================================================================
    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Playback is not paused")]
    NotPaused,

    #[error("Playback is already paused")]
    AlreadyPaused,

    #[error("Live streams cannot be seeked")]
    SeekNotSupported,

    #[error("Cannot seek to {}s, the track is {}s long", .position.as_secs(), .duration.as_secs())]
    SeekOutOfBounds {
        position: Duration,
        duration: Duration,
    },

    #[error("The track is still loading")]
    StillLoading,

    // ========================================================================
    // Component Errors
    // ========================================================================
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Voice stream error: {0}")]
    Sink(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Invalid playback state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },
}

impl PlaybackError {
    /// Errors that describe what the user asked for, safe to show verbatim.
    pub fn is_user_error(&self) -> bool {
        match self {
            PlaybackError::Queue(e) => e.is_user_error(),
            PlaybackError::Fetch(FetchError::Backpressure { .. }) => true,
            PlaybackError::NothingPlaying
            | PlaybackError::NotPaused
            | PlaybackError::AlreadyPaused
            | PlaybackError::SeekNotSupported
            | PlaybackError::SeekOutOfBounds { .. }
            | PlaybackError::StillLoading => true,
            _ => false,
        }
    }
}

impl From<bridge_traits::BridgeError> for PlaybackError {
    fn from(e: bridge_traits::BridgeError) -> Self {
        PlaybackError::Sink(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
