use async_trait::async_trait;
use bridge_traits::{
    ChatId, EgressRoute, FetchFailure, FetchRequest, FetchedMedia, ManualClock, MediaFetcher,
    MediaKind, PlayableSource, Provider, TranscodeProfile, Transcoder,
};
use core_fetch::{
    BackoffPolicy, EgressPool, FetchError, FetchJob, FetchOutcome, FetchPool, FetchReport,
    PoolConfig, Priority, ReportReceiver, TempFiles,
};
use core_queue::TrackId;
use mockall::mock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

mock! {
    pub Fetcher {}

    #[async_trait]
    impl MediaFetcher for Fetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchedMedia, FetchFailure>;
    }
}

struct Passthrough;

#[async_trait]
impl Transcoder for Passthrough {
    async fn transcode(
        &self,
        input: &Path,
        _profile: &TranscodeProfile,
    ) -> Result<PathBuf, FetchFailure> {
        Ok(input.to_path_buf())
    }
}

/// Writes the file only after a permit is released, and reports when it starts.
struct GatedFetcher {
    gate: Arc<Semaphore>,
    started: mpsc::UnboundedSender<PathBuf>,
}

#[async_trait]
impl MediaFetcher for GatedFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedMedia, FetchFailure> {
        std::fs::write(&request.destination, b"partial").map_err(|e| {
            FetchFailure::NetworkError(e.to_string())
        })?;
        let _ = self.started.send(request.destination.clone());
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| FetchFailure::Cancelled)?;
        Ok(FetchedMedia {
            path: request.destination,
            duration_seconds: None,
        })
    }
}

struct Harness {
    _dir: TempDir,
    pool: FetchPool,
    egress: Arc<EgressPool>,
    temp_files: Arc<TempFiles>,
}

fn config(workers: usize, capacity: usize) -> PoolConfig {
    PoolConfig {
        workers,
        queue_capacity: capacity,
        download_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 3),
        profile: TranscodeProfile::default(),
    }
}

fn harness(fetcher: Arc<dyn MediaFetcher>, routes: Vec<EgressRoute>, config: PoolConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let egress = Arc::new(EgressPool::new(routes, 3, Duration::from_secs(300), clock.clone()));
    let temp_files = Arc::new(TempFiles::new(dir.path(), Duration::from_secs(3600), clock));
    let pool = FetchPool::start(
        config,
        fetcher,
        Arc::new(Passthrough),
        egress.clone(),
        temp_files.clone(),
    );
    Harness {
        _dir: dir,
        pool,
        egress,
        temp_files,
    }
}

fn job(priority: Priority) -> (FetchJob, ReportReceiver, CancellationToken) {
    let (reply, reports) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let job = FetchJob::new(
        TrackId::new(),
        ChatId::new(-7),
        PlayableSource::new(Provider::Youtube, "yt:abc", "Song", 30),
        MediaKind::Audio,
        priority,
        cancel.clone(),
        reply,
    );
    (job, reports, cancel)
}

async fn finished(reports: &mut ReportReceiver) -> (FetchOutcome, Vec<FetchReport>) {
    let mut seen = Vec::new();
    while let Some(report) = reports.recv().await {
        if let FetchReport::Finished(result) = report {
            return (result.outcome, seen);
        }
        seen.push(report);
    }
    panic!("report channel closed without a result");
}

fn writes_file() -> impl Fn(FetchRequest) -> Result<FetchedMedia, FetchFailure> + Send + 'static {
    |request| {
        std::fs::write(&request.destination, b"audio").unwrap();
        Ok(FetchedMedia {
            path: request.destination,
            duration_seconds: Some(30),
        })
    }
}

#[tokio::test]
async fn test_successful_fetch_registers_temp_file() {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().times(1).returning(writes_file());
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(2, 4));

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let (outcome, progress) = finished(&mut reports).await;
    let handle = match outcome {
        FetchOutcome::Success(handle) => handle,
        other => panic!("expected success, got {other:?}"),
    };
    assert!(matches!(progress.as_slice(), [FetchReport::Started { attempt: 0, .. }]));
    assert_eq!(handle.duration_seconds, Some(30));
    assert!(handle.path.exists());
    assert_eq!(h.temp_files.ref_count(&handle.path), 1);
    assert_eq!(h.egress.stats()[0].total_successes, 1);
    assert_eq!(h.pool.stats().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retries_then_fails_once() {
    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch()
        .times(3)
        .returning(|_| Err(FetchFailure::NetworkError("reset".to_string())));
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let (outcome, progress) = finished(&mut reports).await;
    assert_eq!(
        outcome,
        FetchOutcome::Failure(FetchFailure::NetworkError("reset".to_string()))
    );
    let retries: Vec<u32> = progress
        .iter()
        .filter_map(|r| match r {
            FetchReport::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);

    // Exactly one final result.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(reports.try_recv().is_err());
    assert_eq!(h.pool.stats().failed, 1);
    assert_eq!(h.egress.stats()[0].total_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_transient_failure_can_succeed() {
    let mut fetcher = MockFetcher::new();
    let mut seq = mockall::Sequence::new();
    fetcher
        .expect_fetch()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(FetchFailure::RateLimited("429".to_string())));
    fetcher
        .expect_fetch()
        .times(1)
        .in_sequence(&mut seq)
        .returning(writes_file());
    let h = harness(
        Arc::new(fetcher),
        vec![EgressRoute::Direct, EgressRoute::Proxy { url: "http://p:1".to_string() }],
        config(1, 4),
    );

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let (outcome, progress) = finished(&mut reports).await;
    assert!(matches!(outcome, FetchOutcome::Success(_)));

    let identities: Vec<&str> = progress
        .iter()
        .filter_map(|r| match r {
            FetchReport::Started { identity, .. } => Some(identity.as_str()),
            _ => None,
        })
        .collect();
    // The failed route is no longer the preferred one.
    assert_eq!(identities, vec!["direct", "proxy-1"]);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch()
        .times(1)
        .returning(|_| Err(FetchFailure::Unavailable("private video".to_string())));
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let (outcome, _) = finished(&mut reports).await;
    assert!(matches!(
        outcome,
        FetchOutcome::Failure(FetchFailure::Unavailable(_))
    ));
    assert_eq!(h.egress.stats()[0].total_failures, 0);
}

#[tokio::test]
async fn test_no_eligible_identity_fails_fast() {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().times(0);
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));
    h.egress.set_enabled("direct", false).unwrap();

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let (outcome, progress) = finished(&mut reports).await;
    assert_eq!(
        outcome,
        FetchOutcome::Failure(FetchFailure::NoEligibleIdentity)
    );
    assert!(progress.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_download_deadline_counts_as_timeout() {
    struct Stalled;

    #[async_trait]
    impl MediaFetcher for Stalled {
        async fn fetch(&self, _request: FetchRequest) -> Result<FetchedMedia, FetchFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(FetchFailure::NetworkError("unreachable".to_string()))
        }
    }

    let mut cfg = config(1, 4);
    cfg.backoff = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(10), 1);
    let h = harness(Arc::new(Stalled), vec![EgressRoute::Direct], cfg);

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let (outcome, _) = finished(&mut reports).await;
    assert_eq!(outcome, FetchOutcome::Failure(FetchFailure::Timeout));
    assert_eq!(h.egress.stats()[0].total_failures, 1);
}

#[tokio::test]
async fn test_cancelled_in_flight_job_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let fetcher = GatedFetcher {
        gate: gate.clone(),
        started: started_tx,
    };
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));

    let (job, mut reports, cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();

    let partial = started_rx.recv().await.unwrap();
    assert!(partial.exists());
    cancel.cancel();

    // Only the Started report, never a result.
    assert!(matches!(reports.recv().await, Some(FetchReport::Started { .. })));
    while h.pool.stats().discarded == 0 {
        tokio::task::yield_now().await;
    }
    assert!(!partial.exists());
    assert!(reports.try_recv().is_err());
    assert_eq!(h.temp_files.stats().files, 0);
}

#[tokio::test]
async fn test_clearing_temp_dir_spares_download_in_progress() {
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let fetcher = GatedFetcher {
        gate: gate.clone(),
        started: started_tx,
    };
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));
    let leftover = h.temp_files.dir().join("stale.webm.part");
    std::fs::write(&leftover, b"old").unwrap();

    let (job, mut reports, _cancel) = job(Priority::Interactive);
    h.pool.submit(job).await.unwrap();
    let partial = started_rx.recv().await.unwrap();

    assert_eq!(h.temp_files.clear_unreferenced().await.unwrap(), 1);
    assert!(partial.exists());
    assert!(!leftover.exists());

    gate.add_permits(1);
    let (outcome, _) = finished(&mut reports).await;
    match outcome {
        FetchOutcome::Success(handle) => assert_eq!(h.temp_files.ref_count(&handle.path), 1),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(h.egress.stats()[0].total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_direct_route_keeps_serving_later_jobs() {
    let mut fetcher = MockFetcher::new();
    let mut seq = mockall::Sequence::new();
    fetcher
        .expect_fetch()
        .times(3)
        .in_sequence(&mut seq)
        .returning(|_| Err(FetchFailure::Timeout));
    fetcher
        .expect_fetch()
        .times(1)
        .in_sequence(&mut seq)
        .returning(writes_file());
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));

    let (first, mut first_reports, _c1) = job(Priority::Interactive);
    h.pool.submit(first).await.unwrap();
    assert_eq!(
        finished(&mut first_reports).await.0,
        FetchOutcome::Failure(FetchFailure::Timeout)
    );
    assert_eq!(h.egress.eligible_count(), 1);

    let (second, mut second_reports, _c2) = job(Priority::Interactive);
    h.pool.submit(second).await.unwrap();
    assert!(matches!(
        finished(&mut second_reports).await.0,
        FetchOutcome::Success(_)
    ));
}

#[tokio::test]
async fn test_job_cancelled_before_pickup_never_runs() {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().times(0);
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));

    let (job, mut reports, cancel) = job(Priority::Background);
    cancel.cancel();
    h.pool.submit(job).await.unwrap();

    while h.pool.stats().discarded == 0 {
        tokio::task::yield_now().await;
    }
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_background_jobs_rejected_when_queue_full() {
    let gate = Arc::new(Semaphore::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let fetcher = GatedFetcher {
        gate: gate.clone(),
        started: started_tx,
    };
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 1));

    // Occupies the only worker.
    let (first, mut first_reports, _c1) = job(Priority::Interactive);
    h.pool.submit(first).await.unwrap();
    started_rx.recv().await.unwrap();

    // Fills the queue.
    let (second, mut second_reports, _c2) = job(Priority::Background);
    h.pool.submit(second).await.unwrap();

    let (third, _r3, _c3) = job(Priority::Background);
    assert!(matches!(
        h.pool.submit(third).await,
        Err(FetchError::Backpressure { capacity: 1 })
    ));
    assert_eq!(h.pool.stats().queued, 1);

    gate.add_permits(2);
    assert!(matches!(finished(&mut first_reports).await.0, FetchOutcome::Success(_)));
    assert!(matches!(finished(&mut second_reports).await.0, FetchOutcome::Success(_)));
}

#[tokio::test]
async fn test_result_for_closed_session_releases_file() {
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().times(1).returning(writes_file());
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(1, 4));

    let (job, reports, _cancel) = job(Priority::Interactive);
    drop(reports);
    h.pool.submit(job).await.unwrap();

    while h.pool.stats().completed == 0 {
        tokio::task::yield_now().await;
    }
    // The release happens right after the failed delivery.
    for _ in 0..100 {
        if h.temp_files.stats().files == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.temp_files.stats().files, 0);
}

#[tokio::test]
async fn test_shutdown_rejects_new_jobs() {
    let fetcher = MockFetcher::new();
    let h = harness(Arc::new(fetcher), vec![EgressRoute::Direct], config(2, 4));
    h.pool.shutdown().await;

    let (job, _reports, _cancel) = job(Priority::Interactive);
    assert!(matches!(h.pool.submit(job).await, Err(FetchError::PoolClosed)));
    assert_eq!(h.pool.stats().workers, 0);
}
