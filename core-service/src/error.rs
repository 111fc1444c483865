use bridge_traits::{BridgeError, ResolutionError};
use core_fetch::FetchError;
use core_playback::PlaybackError;
use core_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    // ========================================================================
    // Command Rejections
    // ========================================================================
    #[error("You are banned from using this bot")]
    Banned,

    #[error("Slow down, try again in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Only admins can use {0}")]
    AdminRequired(&'static str),

    #[error("Nothing is playing in this chat")]
    NoActiveSession,

    #[error("{0}")]
    InvalidArgument(String),

    // ========================================================================
    // Component Errors
    // ========================================================================
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Download service error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),
}

impl ServiceError {
    /// Errors whose text is meant for the chat rather than the logs.
    pub fn is_user_error(&self) -> bool {
        match self {
            ServiceError::Playback(e) => e.is_user_error(),
            ServiceError::Queue(e) => e.is_user_error(),
            ServiceError::Banned
            | ServiceError::RateLimited { .. }
            | ServiceError::AdminRequired(_)
            | ServiceError::NoActiveSession
            | ServiceError::InvalidArgument(_)
            | ServiceError::Resolution(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
