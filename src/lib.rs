//! Workspace placeholder crate.
//!
//! Exposes the feature flags that map to the individual workspace crates so a
//! host bot can depend on `voicecast-workspace` and get the desktop adapters
//! wired in without naming every crate.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
