//! # Core Runtime Module
//!
//! Foundations shared by every engine crate:
//! - Engine configuration with fail-fast validation
//! - Event bus for session, queue, fetch, egress and playback events
//! - Logging and tracing bootstrap
//!
//! ## Overview
//!
//! Nothing in here knows about queues or workers. The other crates depend on
//! it for their configuration values, for publishing events, and for the
//! shared logging conventions.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{EngineConfig, EngineConfigBuilder, VoteThreshold};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventStream};
