//! # Core Fetch
//!
//! Download orchestration shared by every session:
//!
//! - [`EgressPool`]: direct and proxy routes with failure-based cool-downs
//! - [`FetchPool`]: bounded job queue and fixed worker set with deadlines,
//!   bounded retries and exponential backoff
//! - [`TempFiles`]: reference-counted registry of downloaded files and the
//!   periodic sweeper
//!
//! Sessions talk to the pool with [`FetchJob`]s and get [`FetchReport`]s back
//! on their own channel.

pub mod egress;
pub mod error;
pub mod job;
pub mod pool;
pub mod temp_files;

pub use egress::{
    parse_proxy, parse_proxy_list, EgressIdentity, EgressPool, IdentityKind, IdentityStats,
    DIRECT_IDENTITY_ID,
};
pub use error::{FetchError, Result};
pub use job::{
    BackoffPolicy, FetchJob, FetchOutcome, FetchReport, FetchResult, Priority, ReportReceiver,
    ReportSender,
};
pub use pool::{FetchPool, PoolConfig, PoolStats};
pub use temp_files::{Reservation, TempFileStats, TempFiles};
