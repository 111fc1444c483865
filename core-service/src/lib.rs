//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided collaborators (resolver, fetcher,
//! transcoder, streaming sink, chat notifier, snapshot store) into the
//! engine and exposes the chat command surface. Native bots typically enable
//! the `desktop-shims` feature, which supplies the SQLite store and HTTP
//! fetcher from `bridge-desktop`, and only provide the chat-specific
//! pieces themselves.

pub mod bans;
pub mod command;
#[cfg(feature = "desktop-shims")]
pub mod desktop;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod service;

pub use bans::BanList;
pub use command::{Command, CommandKind, Reply};
#[cfg(feature = "desktop-shims")]
pub use desktop::{bootstrap_desktop, DesktopHost};
pub use error::{Result, ServiceError};
pub use rate_limit::RateLimiter;
pub use registry::SessionRegistry;
pub use service::{CoreDependencies, CoreService, ServiceStats};
