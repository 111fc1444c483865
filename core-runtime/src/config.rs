//! # Engine Configuration
//!
//! Limits and timings shared by the queue manager, the fetch pool, the egress
//! pool and the playback controllers.
//!
//! ## Overview
//!
//! [`EngineConfig`] is built either programmatically through
//! [`EngineConfig::builder`] or from the recognized environment options via
//! [`EngineConfig::from_env`]. Both paths end in [`EngineConfig::validate`],
//! so an engine never starts with limits that contradict each other.
//!
//! ## Recognized options
//!
//! | Option                    | Default | Meaning |
//! |---------------------------|---------|---------|
//! | `MAX_QUEUE_LENGTH`        | 50      | Tracks per session queue |
//! | `MAX_PLAYLIST_SIZE`       | 25      | Items taken from one playlist |
//! | `MAX_USER_QUEUE`          | 10      | Queued tracks per user per session |
//! | `DEFAULT_VOLUME`          | 80      | Initial session volume (0-200) |
//! | `MAX_DURATION`            | 7200    | Longest non-live track, seconds |
//! | `AUTO_LEAVE_DELAY`        | 300     | Idle seconds before a session is torn down |
//! | `TEMP_FILE_CLEANUP`       | 3600    | Maximum age of a downloaded file, seconds |
//! | `MAX_YT_DOWNLOADS`        | 10      | Fetch workers |
//! | `YT_DOWNLOAD_TIMEOUT`     | 120     | Deadline per fetch attempt, seconds |
//! | `MAX_RETRIES`             | 3       | Failed attempts before a track is skipped |
//! | `PROXY_ROTATION_INTERVAL` | 300     | Cool-down of a failing proxy, seconds |
//! | `MAX_PROXY_FAILURES`      | 3       | Consecutive failures before cool-down |
//! | `ENABLE_LIVE_STREAMS`     | true    | Accept live sources |
//! | `ENABLE_VOTING_SYSTEM`    | false   | Skip requires a listener vote |
//! | `PROXY_LIST`              | empty   | Comma separated proxies |
//! | `TEMP_DIR`                | `<tmp>/voicecast` | Download directory |
//! | `VOTE_SKIP_MIN`           | unset   | Fixed vote threshold instead of majority |
//! | `RATE_LIMIT_COMMANDS`     | 5       | Commands per user per window |
//! | `RATE_LIMIT_WINDOW`       | 10      | Rate limit window, seconds |
//! | `AUDIO_BITRATE`           | 192     | Transcode bitrate, kbps |
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::builder()
//!     .max_queue_length(100)
//!     .max_user_queue(5)
//!     .auto_leave_delay(Duration::from_secs(120))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.max_queue_length, 100);
//! ```

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for fetch workers, beyond which providers start banning.
pub const MAX_WORKERS: usize = 64;

/// Highest accepted session volume.
pub const MAX_VOLUME: u16 = 200;

/// How skip requests are decided when voting is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteThreshold {
    /// More than half of the listeners currently in the call.
    Majority,
    /// A fixed number of distinct voters.
    Fixed(usize),
}

impl VoteThreshold {
    /// Votes needed given the current listener count. Never below one.
    pub fn required_votes(&self, listeners: usize) -> usize {
        match self {
            VoteThreshold::Majority => listeners / 2 + 1,
            VoteThreshold::Fixed(n) => (*n).max(1),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_queue_length: usize,
    pub max_playlist_size: usize,
    pub max_user_queue: usize,
    pub default_volume: u16,
    pub max_duration: Duration,
    pub auto_leave_delay: Duration,
    pub temp_file_cleanup: Duration,
    /// Number of fetch workers (`MAX_YT_DOWNLOADS`).
    pub max_downloads: usize,
    pub download_timeout: Duration,
    pub max_retries: u32,
    pub proxy_rotation_interval: Duration,
    pub max_proxy_failures: u32,
    pub enable_live_streams: bool,
    pub enable_voting_system: bool,
    pub vote_threshold: VoteThreshold,
    pub proxies: Vec<String>,
    pub temp_dir: PathBuf,
    /// Job queue capacity is `max_downloads * job_backlog_factor`.
    pub job_backlog_factor: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Period of the temp-file sweep and the egress rotation pass.
    pub maintenance_interval: Duration,
    pub rate_limit_commands: u32,
    pub rate_limit_window: Duration,
    pub audio_bitrate_kbps: u32,
    pub audio_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 50,
            max_playlist_size: 25,
            max_user_queue: 10,
            default_volume: 80,
            max_duration: Duration::from_secs(7200),
            auto_leave_delay: Duration::from_secs(300),
            temp_file_cleanup: Duration::from_secs(3600),
            max_downloads: 10,
            download_timeout: Duration::from_secs(120),
            max_retries: 3,
            proxy_rotation_interval: Duration::from_secs(300),
            max_proxy_failures: 3,
            enable_live_streams: true,
            enable_voting_system: false,
            vote_threshold: VoteThreshold::Majority,
            proxies: Vec::new(),
            temp_dir: std::env::temp_dir().join("voicecast"),
            job_backlog_factor: 4,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
            rate_limit_commands: 5,
            rate_limit_window: Duration::from_secs(10),
            audio_bitrate_kbps: 192,
            audio_format: "opus".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Read the recognized options from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the recognized options through `lookup`, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_opt(&lookup, "MAX_QUEUE_LENGTH")? {
            config.max_queue_length = v;
        }
        if let Some(v) = parse_opt(&lookup, "MAX_PLAYLIST_SIZE")? {
            config.max_playlist_size = v;
        }
        if let Some(v) = parse_opt(&lookup, "MAX_USER_QUEUE")? {
            config.max_user_queue = v;
        }
        if let Some(v) = parse_opt(&lookup, "DEFAULT_VOLUME")? {
            config.default_volume = v;
        }
        if let Some(v) = parse_secs(&lookup, "MAX_DURATION")? {
            config.max_duration = v;
        }
        if let Some(v) = parse_secs(&lookup, "AUTO_LEAVE_DELAY")? {
            config.auto_leave_delay = v;
        }
        if let Some(v) = parse_secs(&lookup, "TEMP_FILE_CLEANUP")? {
            config.temp_file_cleanup = v;
        }
        if let Some(v) = parse_opt(&lookup, "MAX_YT_DOWNLOADS")? {
            config.max_downloads = v;
        }
        if let Some(v) = parse_secs(&lookup, "YT_DOWNLOAD_TIMEOUT")? {
            config.download_timeout = v;
        }
        if let Some(v) = parse_opt(&lookup, "MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = parse_secs(&lookup, "PROXY_ROTATION_INTERVAL")? {
            config.proxy_rotation_interval = v;
        }
        if let Some(v) = parse_opt(&lookup, "MAX_PROXY_FAILURES")? {
            config.max_proxy_failures = v;
        }
        if let Some(v) = parse_bool(&lookup, "ENABLE_LIVE_STREAMS")? {
            config.enable_live_streams = v;
        }
        if let Some(v) = parse_bool(&lookup, "ENABLE_VOTING_SYSTEM")? {
            config.enable_voting_system = v;
        }
        if let Some(v) = parse_opt(&lookup, "VOTE_SKIP_MIN")? {
            config.vote_threshold = VoteThreshold::Fixed(v);
        }
        if let Some(raw) = lookup("PROXY_LIST") {
            config.proxies = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("TEMP_DIR") {
            if !raw.trim().is_empty() {
                config.temp_dir = PathBuf::from(raw.trim());
            }
        }
        if let Some(v) = parse_opt(&lookup, "RATE_LIMIT_COMMANDS")? {
            config.rate_limit_commands = v;
        }
        if let Some(v) = parse_secs(&lookup, "RATE_LIMIT_WINDOW")? {
            config.rate_limit_window = v;
        }
        if let Some(v) = parse_opt(&lookup, "AUDIO_BITRATE")? {
            config.audio_bitrate_kbps = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Capacity of the global fetch job queue.
    pub fn job_queue_capacity(&self) -> usize {
        self.max_downloads.saturating_mul(self.job_backlog_factor)
    }

    /// Fail fast on contradictory or out-of-range limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_length == 0 {
            return Err(Error::Config(
                "MAX_QUEUE_LENGTH must be greater than 0".to_string(),
            ));
        }

        if self.max_user_queue == 0 {
            return Err(Error::Config(
                "MAX_USER_QUEUE must be greater than 0".to_string(),
            ));
        }

        if self.max_user_queue > self.max_queue_length {
            return Err(Error::Config(format!(
                "MAX_USER_QUEUE ({}) cannot exceed MAX_QUEUE_LENGTH ({})",
                self.max_user_queue, self.max_queue_length
            )));
        }

        if self.max_playlist_size == 0 {
            return Err(Error::Config(
                "MAX_PLAYLIST_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.default_volume > MAX_VOLUME {
            return Err(Error::Config(format!(
                "DEFAULT_VOLUME must be between 0 and {}",
                MAX_VOLUME
            )));
        }

        if self.max_downloads == 0 || self.max_downloads > MAX_WORKERS {
            return Err(Error::Config(format!(
                "MAX_YT_DOWNLOADS must be between 1 and {}",
                MAX_WORKERS
            )));
        }

        if self.job_backlog_factor == 0 {
            return Err(Error::Config(
                "Job backlog factor must be greater than 0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(Error::Config(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        if self.max_proxy_failures == 0 {
            return Err(Error::Config(
                "MAX_PROXY_FAILURES must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("MAX_DURATION", self.max_duration),
            ("AUTO_LEAVE_DELAY", self.auto_leave_delay),
            ("TEMP_FILE_CLEANUP", self.temp_file_cleanup),
            ("YT_DOWNLOAD_TIMEOUT", self.download_timeout),
            ("PROXY_ROTATION_INTERVAL", self.proxy_rotation_interval),
            ("RATE_LIMIT_WINDOW", self.rate_limit_window),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.maintenance_interval.is_zero() {
            return Err(Error::Config(
                "Maintenance interval must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::Config(
                "Retry base delay cannot exceed the retry delay cap".to_string(),
            ));
        }

        if let VoteThreshold::Fixed(0) = self.vote_threshold {
            return Err(Error::Config(
                "VOTE_SKIP_MIN must be at least 1".to_string(),
            ));
        }

        if self.rate_limit_commands == 0 {
            return Err(Error::Config(
                "RATE_LIMIT_COMMANDS must be greater than 0".to_string(),
            ));
        }

        if self.audio_bitrate_kbps == 0 || self.audio_format.trim().is_empty() {
            return Err(Error::Config(
                "Transcode profile needs a format and a non-zero bitrate".to_string(),
            ));
        }

        if self.temp_dir.as_os_str().is_empty() {
            return Err(Error::Config("TEMP_DIR cannot be empty".to_string()));
        }

        Ok(())
    }
}

fn parse_opt<T, F>(lookup: &F, option: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(option) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::InvalidOption {
                option: option.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_secs<F>(lookup: &F, option: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt::<u64, F>(lookup, option)?.map(Duration::from_secs))
}

fn parse_bool<F>(lookup: &F, option: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(option) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::InvalidOption {
            option: option.to_string(),
            value: raw,
            reason: "expected true/false".to_string(),
        }),
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn max_queue_length(mut self, value: usize) -> Self {
        self.config.max_queue_length = value;
        self
    }

    pub fn max_playlist_size(mut self, value: usize) -> Self {
        self.config.max_playlist_size = value;
        self
    }

    pub fn max_user_queue(mut self, value: usize) -> Self {
        self.config.max_user_queue = value;
        self
    }

    pub fn default_volume(mut self, value: u16) -> Self {
        self.config.default_volume = value;
        self
    }

    pub fn max_duration(mut self, value: Duration) -> Self {
        self.config.max_duration = value;
        self
    }

    pub fn auto_leave_delay(mut self, value: Duration) -> Self {
        self.config.auto_leave_delay = value;
        self
    }

    pub fn temp_file_cleanup(mut self, value: Duration) -> Self {
        self.config.temp_file_cleanup = value;
        self
    }

    pub fn max_downloads(mut self, value: usize) -> Self {
        self.config.max_downloads = value;
        self
    }

    pub fn download_timeout(mut self, value: Duration) -> Self {
        self.config.download_timeout = value;
        self
    }

    pub fn max_retries(mut self, value: u32) -> Self {
        self.config.max_retries = value;
        self
    }

    pub fn proxy_rotation_interval(mut self, value: Duration) -> Self {
        self.config.proxy_rotation_interval = value;
        self
    }

    pub fn max_proxy_failures(mut self, value: u32) -> Self {
        self.config.max_proxy_failures = value;
        self
    }

    pub fn enable_live_streams(mut self, enabled: bool) -> Self {
        self.config.enable_live_streams = enabled;
        self
    }

    pub fn enable_voting_system(mut self, enabled: bool) -> Self {
        self.config.enable_voting_system = enabled;
        self
    }

    pub fn vote_threshold(mut self, threshold: VoteThreshold) -> Self {
        self.config.vote_threshold = threshold;
        self
    }

    pub fn proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn temp_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.temp_dir = path.into();
        self
    }

    pub fn job_backlog_factor(mut self, factor: usize) -> Self {
        self.config.job_backlog_factor = factor;
        self
    }

    /// Exponential backoff parameters for fetch retries.
    pub fn retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = cap;
        self
    }

    pub fn maintenance_interval(mut self, value: Duration) -> Self {
        self.config.maintenance_interval = value;
        self
    }

    pub fn rate_limit(mut self, commands: u32, window: Duration) -> Self {
        self.config.rate_limit_commands = commands;
        self.config.rate_limit_window = window;
        self
    }

    pub fn audio_profile(mut self, format: impl Into<String>, bitrate_kbps: u32) -> Self {
        self.config.audio_format = format.into();
        self.config.audio_bitrate_kbps = bitrate_kbps;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
