//! # Fetch Worker Pool
//!
//! Fixed set of workers pulling [`FetchJob`]s from one bounded queue shared
//! by all sessions.
//!
//! ## Job lifecycle
//!
//! 1. `submit` puts the job on the queue. Interactive jobs wait for room,
//!    background jobs are rejected with [`FetchError::Backpressure`].
//! 2. A worker acquires an egress identity, then fetches under the download
//!    deadline and transcodes the result.
//! 3. A transient failure is charged to the identity (when the route is to
//!    blame) and the job is re-queued after a backoff, with `attempt + 1`.
//!    Once `max_retries` attempts have failed, the failure is final.
//! 4. The outcome is reported to the session that owns the job.
//!
//! Cancelling the job's token at any point discards the work and deletes
//! partial files. Workers process their jobs in arrival order; ordering
//! across workers is not guaranteed.
//!
//! ## Usage
//!
//! ```ignore
//! let pool = FetchPool::start(config, fetcher, transcoder, egress, temp_files);
//! let (reply, mut reports) = tokio::sync::mpsc::unbounded_channel();
//! pool.submit(FetchJob::new(track_id, chat_id, source, media, Priority::Interactive, token, reply)).await?;
//! while let Some(report) = reports.recv().await { /* ... */ }
//! ```

use bridge_traits::{
    AudioHandle, FetchFailure, FetchRequest, MediaFetcher, TranscodeProfile, Transcoder,
};
use core_runtime::events::{CoreEvent, EventBus, FetchEvent};
use core_runtime::EngineConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::egress::EgressPool;
use crate::error::{FetchError, Result};
use crate::job::{BackoffPolicy, FetchJob, FetchOutcome, FetchReport, FetchResult, Priority};
use crate::temp_files::TempFiles;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub download_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub profile: TranscodeProfile,
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.max_downloads,
            queue_capacity: config.job_queue_capacity(),
            download_timeout: config.download_timeout,
            backoff: BackoffPolicy::from(config),
            profile: TranscodeProfile {
                format: config.audio_format.clone(),
                bitrate_kbps: config.audio_bitrate_kbps,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub capacity: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
}

struct Shared {
    config: PoolConfig,
    fetcher: Arc<dyn MediaFetcher>,
    transcoder: Arc<dyn Transcoder>,
    egress: Arc<EgressPool>,
    temp_files: Arc<TempFiles>,
    event_bus: Option<Arc<EventBus>>,
    requeue: mpsc::Sender<FetchJob>,
    shutdown: CancellationToken,
    counters: Counters,
}

pub struct FetchPool {
    sender: mpsc::Sender<FetchJob>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FetchPool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(
        config: PoolConfig,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn Transcoder>,
        egress: Arc<EgressPool>,
        temp_files: Arc<TempFiles>,
    ) -> Self {
        Self::start_with_events(config, fetcher, transcoder, egress, temp_files, None)
    }

    pub fn start_with_events(
        config: PoolConfig,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn Transcoder>,
        egress: Arc<EgressPool>,
        temp_files: Arc<TempFiles>,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let shared = Arc::new(Shared {
            config,
            fetcher,
            transcoder,
            egress,
            temp_files,
            event_bus,
            requeue: sender.clone(),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        });

        let workers = (0..worker_count)
            .map(|index| {
                let shared = shared.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move { worker_loop(index, shared, receiver).await })
            })
            .collect();

        info!(workers = worker_count, capacity, "Fetch pool started");

        Self {
            sender,
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job. Background jobs fail fast when the queue is full.
    #[instrument(skip(self, job), fields(chat_id = %job.chat_id, track_id = %job.track_id, priority = ?job.priority))]
    pub async fn submit(&self, job: FetchJob) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(FetchError::PoolClosed);
        }

        match job.priority {
            Priority::Interactive => self
                .sender
                .send(job)
                .await
                .map_err(|_| FetchError::PoolClosed),
            Priority::Background => match self.sender.try_send(job) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Job queue full, background job rejected");
                    Err(FetchError::Backpressure {
                        capacity: self.capacity(),
                    })
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(FetchError::PoolClosed),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn egress(&self) -> &Arc<EgressPool> {
        &self.shared.egress
    }

    pub fn temp_files(&self) -> &Arc<TempFiles> {
        &self.shared.temp_files
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            workers: self.workers.lock().len(),
            capacity: self.capacity(),
            queued: self.sender.max_capacity() - self.sender.capacity(),
            in_flight: counters.in_flight.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for the workers to exit.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Fetch worker ended abnormally");
            }
        }
        info!("Fetch pool stopped");
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn worker_loop(
    index: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<FetchJob>>>,
) {
    debug!(worker = index, "Fetch worker started");
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = shared.shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };

        let Some(job) = job else { break };
        shared.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        shared.process(job).await;
        shared.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
    debug!(worker = index, "Fetch worker stopped");
}

impl Shared {
    fn emit(&self, event: FetchEvent) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(CoreEvent::Fetch(event));
        }
    }

    async fn process(self: &Arc<Self>, mut job: FetchJob) {
        if job.cancel.is_cancelled() {
            self.discard(&job, &[]);
            return;
        }

        let identity = match self.egress.acquire() {
            Ok(identity) => identity,
            Err(_) => {
                self.finish(&job, FetchOutcome::Failure(FetchFailure::NoEligibleIdentity));
                return;
            }
        };
        job.assigned_identity = Some(identity.id.clone());

        debug!(
            chat_id = %job.chat_id,
            track_id = %job.track_id,
            attempt = job.attempt + 1,
            identity = %identity.id,
            "Fetch attempt started"
        );
        job.report(FetchReport::Started {
            track_id: job.track_id,
            attempt: job.attempt,
            identity: identity.id.clone(),
        });
        self.emit(FetchEvent::Started {
            chat_id: job.chat_id,
            track_id: job.track_id.to_string(),
            attempt: job.attempt + 1,
            route: identity.route.to_string(),
        });

        let destination = self
            .temp_files
            .dir()
            .join(format!("{}_{}", job.chat_id, job.track_id));
        let _reservation = self.temp_files.reserve(&destination);
        let request = FetchRequest {
            source: job.source.clone(),
            media: job.media,
            route: identity.route.clone(),
            destination: destination.clone(),
            attempt: job.attempt + 1,
        };

        let fetched = tokio::select! {
            _ = job.cancel.cancelled() => {
                self.discard(&job, &[destination.as_path()]);
                return;
            }
            result = timeout(self.config.download_timeout, self.fetcher.fetch(request)) => {
                result.unwrap_or(Err(FetchFailure::Timeout))
            }
        };

        let media = match fetched {
            Ok(media) => media,
            Err(failure) => {
                if failure.blames_route() {
                    if let Err(e) = self.egress.report_failure(&identity.id) {
                        warn!(error = %e, "Could not record egress failure");
                    }
                }
                self.handle_failure(job, failure, &[destination.as_path()]);
                return;
            }
        };
        if let Err(e) = self.egress.report_success(&identity.id) {
            warn!(error = %e, "Could not record egress success");
        }

        let transcoded = tokio::select! {
            _ = job.cancel.cancelled() => {
                self.discard(&job, &[media.path.as_path()]);
                return;
            }
            result = self.transcoder.transcode(&media.path, &self.config.profile) => result,
        };

        let output = match transcoded {
            Ok(output) => output,
            Err(failure) => {
                self.handle_failure(job, failure, &[media.path.as_path()]);
                return;
            }
        };
        if output != media.path {
            remove_quietly(&media.path);
        }

        if job.cancel.is_cancelled() {
            self.discard(&job, &[output.as_path()]);
            return;
        }

        self.temp_files.register(&output, job.chat_id);
        let mut handle = AudioHandle::new(output.clone(), job.media);
        handle.duration_seconds = media.duration_seconds;
        if !self.finish(&job, FetchOutcome::Success(handle)) {
            self.temp_files.release(&output);
        }
    }

    fn handle_failure(self: &Arc<Self>, mut job: FetchJob, failure: FetchFailure, partial: &[&Path]) {
        for path in partial {
            remove_quietly(path);
        }

        if failure == FetchFailure::Cancelled {
            self.discard(&job, &[]);
            return;
        }

        let failures = job.attempt + 1;
        if !failure.is_transient() || self.config.backoff.exhausted(failures) {
            self.finish(&job, FetchOutcome::Failure(failure));
            return;
        }

        let delay = self
            .config
            .backoff
            .delay_with_jitter(job.attempt, &mut rand::thread_rng());
        job.attempt = failures;
        job.assigned_identity = None;
        self.counters.retried.fetch_add(1, Ordering::Relaxed);

        warn!(
            chat_id = %job.chat_id,
            track_id = %job.track_id,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Fetch failed, retrying"
        );
        job.report(FetchReport::Retrying {
            track_id: job.track_id,
            attempt: job.attempt,
            delay,
        });
        self.emit(FetchEvent::Retrying {
            chat_id: job.chat_id,
            track_id: job.track_id.to_string(),
            attempt: job.attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = job.cancel.cancelled() => shared.discard(&job, &[]),
                _ = shared.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let sender = shared.requeue.clone();
                    if sender.send(job).await.is_err() {
                        debug!("Fetch pool closed before retry");
                    }
                }
            }
        });
    }

    /// Deliver the final outcome. Returns `false` if the session is gone.
    fn finish(&self, job: &FetchJob, outcome: FetchOutcome) -> bool {
        match &outcome {
            FetchOutcome::Success(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(chat_id = %job.chat_id, track_id = %job.track_id, "Fetch completed");
                self.emit(FetchEvent::Completed {
                    chat_id: job.chat_id,
                    track_id: job.track_id.to_string(),
                });
            }
            FetchOutcome::Failure(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    chat_id = %job.chat_id,
                    track_id = %job.track_id,
                    attempts = job.attempt + 1,
                    error = %failure,
                    "Fetch failed"
                );
                self.emit(FetchEvent::Failed {
                    chat_id: job.chat_id,
                    track_id: job.track_id.to_string(),
                    reason: failure.to_string(),
                });
            }
        }

        job.report(FetchReport::Finished(FetchResult {
            track_id: job.track_id,
            chat_id: job.chat_id,
            outcome,
        }))
    }

    fn discard(&self, job: &FetchJob, partial: &[&Path]) {
        for path in partial {
            remove_quietly(path);
        }
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(chat_id = %job.chat_id, track_id = %job.track_id, "Fetch discarded");
        self.emit(FetchEvent::Discarded {
            chat_id: job.chat_id,
            track_id: job.track_id.to_string(),
        });
    }
}

/// Best-effort removal of a partial download.
fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}
