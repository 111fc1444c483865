//! # Desktop Bridge Implementations
//!
//! Default native implementations of the host bridge traits.
//!
//! ## Overview
//!
//! - [`SqliteSnapshotStore`] - `SnapshotStore` backed by SQLite via `sqlx`
//! - [`HttpFetcher`] - `MediaFetcher` for direct media links via `reqwest`,
//!   honoring the proxy of each egress route
//! - [`PassthroughTranscoder`] - `Transcoder` for sinks that accept the
//!   downloaded container
//! - [`ConsoleNotifier`] - `ChatNotifier` that logs replies
//!
//! The voice-call transport has no desktop default; hosts plug in their own
//! `StreamingSink`.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{HttpFetcher, SqliteSnapshotStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = SqliteSnapshotStore::new("data/voicecast.db".into()).await?;
//!     let fetcher = HttpFetcher::new();
//!
//!     // Hand both to the core service
//! }
//! ```

mod fetcher;
mod notifier;
mod store;
mod transcode;

pub use fetcher::HttpFetcher;
pub use notifier::ConsoleNotifier;
pub use store::SqliteSnapshotStore;
pub use transcode::PassthroughTranscoder;
