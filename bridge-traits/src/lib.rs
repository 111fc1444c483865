//! # Host Bridge Traits
//!
//! Contracts between the playback engine and the collaborators it does not
//! own: the chat transport, the voice-streaming transport, provider
//! resolution, the downloader/transcoder and the persistent store.
//!
//! ## Traits
//!
//! ### Chat & Voice
//! - [`ChatNotifier`](chat::ChatNotifier) - Replies to a chat, reports listener counts
//! - [`StreamingSink`](sink::StreamingSink) - Opens [`StreamSession`](sink::StreamSession)s into a voice call
//!
//! ### Media
//! - [`SourceResolver`](resolver::SourceResolver) - Query/URL to [`PlayableSource`](resolver::PlayableSource)
//! - [`MediaFetcher`](fetch::MediaFetcher) - Downloads a source through an [`EgressRoute`](fetch::EgressRoute)
//! - [`Transcoder`](fetch::Transcoder) - Converts downloads to the sink format
//!
//! ### Storage & Utilities
//! - [`SnapshotStore`](storage::SnapshotStore) - Session snapshots and the ban list
//! - [`Clock`](time::Clock) - Wall-clock source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Transport-level traits return [`BridgeError`](error::BridgeError). Resolution
//! and fetching have their own domain failures
//! ([`ResolutionError`](resolver::ResolutionError),
//! [`FetchFailure`](fetch::FetchFailure)) because the engine reacts to each
//! kind differently.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; one instance is shared by every session
//! and worker.

pub mod chat;
pub mod error;
pub mod fetch;
pub mod ids;
pub mod resolver;
pub mod sink;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use chat::ChatNotifier;
pub use fetch::{
    EgressRoute, FetchFailure, FetchRequest, FetchedMedia, MediaFetcher, TranscodeProfile,
    Transcoder,
};
pub use ids::{ChatId, UserId};
pub use resolver::{MediaKind, PlayableSource, Provider, ResolutionError, SourceResolver};
pub use sink::{
    AudioHandle, SinkEvent, SinkEventKind, SinkEventReceiver, SinkEventSender, StreamId,
    StreamOptions, StreamSession, StreamingSink,
};
pub use storage::SnapshotStore;
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
