use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Download queue is full ({capacity} jobs), try again shortly")]
    Backpressure { capacity: usize },

    #[error("No egress identity is currently available")]
    NoEligibleIdentity,

    #[error("Invalid proxy '{proxy}': {reason}")]
    InvalidProxy { proxy: String, reason: String },

    #[error("Egress identity not found: {0}")]
    IdentityNotFound(String),

    #[error("Fetch pool is shut down")]
    PoolClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FetchError>;
