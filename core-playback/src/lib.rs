//! # Playback Sessions
//!
//! Per-chat playback controllers.
//!
//! ## Overview
//!
//! Each chat with a queue gets one [`SessionHandle`], a mailbox in front of an
//! actor task that owns the chat's queue, the playback state machine, the
//! open voice stream and the skip votes. The actor reacts to:
//! - user commands (enqueue, skip, pause, seek, volume, loop, ...)
//! - fetch results from the shared worker pool
//! - completion and error events from the streaming sink
//! - its own idle timer
//!
//! ## Usage
//!
//! ```ignore
//! let (handle, _task) = SessionHandle::spawn(chat_id, ctx, teardown_tx, None);
//! let enqueued = handle.enqueue(user, source, MediaKind::Audio).await?;
//! handle.skip(user, false).await?;
//! ```

pub mod error;
pub mod session;
pub mod state;

pub use error::{PlaybackError, Result};
pub use session::{
    Enqueued, NowPlaying, PlaylistOutcome, Removed, SessionContext, SessionHandle, SessionStatus,
    SkipOutcome, TeardownReason, TeardownReceiver, TeardownRequest, TeardownSender,
};
pub use state::{PlaybackState, PositionAnchor, VoteTally};
