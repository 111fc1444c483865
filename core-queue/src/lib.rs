//! # Core Queue
//!
//! Per-session queue state for the playback engine.
//!
//! ## Overview
//!
//! - [`Track`] and its forward-only [`TrackStatus`] machine
//! - [`SessionQueue`]: admission limits, per-user quota, reorder and
//!   shuffle around a pinned head, and the [`LoopMode`] policy applied when
//!   the head completes
//! - [`SessionSnapshot`]: the persisted form of a session
//! - display helpers such as [`format_duration`] and [`parse_time_string`]
//!
//! The queue does no I/O and holds no locks. The playback actor owning it is
//! the single writer.

pub mod error;
pub mod format;
pub mod queue;
pub mod snapshot;
pub mod track;

pub use error::{QueueError, Result};
pub use format::{
    format_duration, format_queue_page, format_track_line, parse_time_string, QUEUE_PAGE_SIZE,
};
pub use queue::{LoopMode, QueueLimits, RemoveOutcome, SessionQueue, HISTORY_CAPACITY};
pub use snapshot::{SessionSnapshot, TrackSnapshot, SNAPSHOT_VERSION};
pub use track::{Track, TrackId, TrackStatus};
