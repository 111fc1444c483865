//! Fetch jobs, results and the retry schedule.

use bridge_traits::{AudioHandle, ChatId, FetchFailure, MediaKind, PlayableSource};
use core_queue::TrackId;
use core_runtime::EngineConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How `submit` behaves when the job queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// The track is needed now (head of its queue): wait for room.
    Interactive,
    /// Prefetch: reject with a backpressure error instead of waiting.
    Background,
}

/// Receiving end for one session's job reports.
pub type ReportReceiver = mpsc::UnboundedReceiver<FetchReport>;
pub type ReportSender = mpsc::UnboundedSender<FetchReport>;

/// One download + transcode request for a track.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub track_id: TrackId,
    pub chat_id: ChatId,
    pub source: PlayableSource,
    pub media: MediaKind,
    /// Failed attempts so far.
    pub attempt: u32,
    pub assigned_identity: Option<String>,
    pub priority: Priority,
    pub cancel: CancellationToken,
    reply: ReportSender,
}

impl FetchJob {
    pub fn new(
        track_id: TrackId,
        chat_id: ChatId,
        source: PlayableSource,
        media: MediaKind,
        priority: Priority,
        cancel: CancellationToken,
        reply: ReportSender,
    ) -> Self {
        Self {
            track_id,
            chat_id,
            source,
            media,
            attempt: 0,
            assigned_identity: None,
            priority,
            cancel,
            reply,
        }
    }

    /// Send a report to the originating session. Returns `false` once the
    /// session is gone.
    pub(crate) fn report(&self, report: FetchReport) -> bool {
        self.reply.send(report).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(AudioHandle),
    Failure(FetchFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub track_id: TrackId,
    pub chat_id: ChatId,
    pub outcome: FetchOutcome,
}

/// Progress messages a session receives for its jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReport {
    /// A worker began an attempt (`attempt` is the failed-attempt count so far).
    Started {
        track_id: TrackId,
        attempt: u32,
        identity: String,
    },
    /// The attempt failed transiently; the job comes back after `delay`.
    Retrying {
        track_id: TrackId,
        attempt: u32,
        delay: Duration,
    },
    Finished(FetchResult),
}

impl FetchReport {
    pub fn track_id(&self) -> TrackId {
        match self {
            FetchReport::Started { track_id, .. } | FetchReport::Retrying { track_id, .. } => {
                *track_id
            }
            FetchReport::Finished(result) => result.track_id,
        }
    }
}

/// Exponential backoff with a cap and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// A job fails for good once it has failed this many times.
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries: max_retries.max(1),
        }
    }

    /// `min(base * 2^attempt, cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// [`delay`](Self::delay) plus up to half of it again as jitter.
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        let spread = delay.as_millis() as u64 / 2;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng.gen_range(0..=spread))
    }

    /// Whether a job with `failures` failed attempts is out of retries.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }
}

impl From<&EngineConfig> for BackoffPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self::new(
            config.retry_base_delay,
            config.retry_max_delay,
            config.max_retries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let policy = BackoffPolicy::new(Duration::from_millis(400), Duration::from_secs(10), 3);
        let mut rng = StdRng::seed_from_u64(1);
        for attempt in 0..4 {
            let base = policy.delay(attempt);
            for _ in 0..50 {
                let d = policy.delay_with_jitter(attempt, &mut rng);
                assert!(d >= base && d <= base + base / 2);
            }
        }
    }

    #[test]
    fn test_exhausted_counts_failures() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 3);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 0).exhausted(1));
    }
}
