use super::validate::Validator;
use super::{
    DownloadItem, DownloadJob, Fetcher, ItemOutcome, ItemStatus, JobResult,
};
use crate::errors::{AppError, Result};
use crate::processing::PostProcessor;
use crate::search::Resolver;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const FETCH_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Point-in-time view of a running job, polled by the CLI progress bar and
/// the web status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub pending: usize,
    pub active: usize,
    pub complete: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub messages: HashMap<String, String>,
}

impl ProgressSnapshot {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.complete + self.failed + self.cancelled
    }

    pub fn done(&self) -> usize {
        self.complete + self.failed + self.cancelled
    }
}

/// Aggregated progress state shared between workers. All mutation goes
/// through this one synchronized struct.
#[derive(Default)]
pub struct ProgressTracker {
    inner: Mutex<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reset(&self, total: usize) {
        let mut inner = self.inner.lock().await;
        *inner = ProgressSnapshot::default();
        inner.pending = total;
    }

    pub async fn item_active(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        inner.pending = inner.pending.saturating_sub(1);
        inner.active += 1;
        inner.messages.insert(id.to_string(), message.to_string());
    }

    pub async fn set_message(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        inner.messages.insert(id.to_string(), message.to_string());
    }

    pub async fn item_requeued(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        inner.active = inner.active.saturating_sub(1);
        inner.pending += 1;
        inner.messages.insert(id.to_string(), message.to_string());
    }

    pub async fn item_complete(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.active = inner.active.saturating_sub(1);
        inner.complete += 1;
        inner.messages.insert(id.to_string(), "Complete".to_string());
    }

    pub async fn item_failed(&self, id: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        inner.active = inner.active.saturating_sub(1);
        inner.failed += 1;
        inner.messages.insert(id.to_string(), message.to_string());
    }

    pub async fn item_cancelled(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.pending = inner.pending.saturating_sub(1);
        inner.cancelled += 1;
        inner.messages.insert(id.to_string(), "Cancelled".to_string());
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().await.clone()
    }
}

/// External stop signal. Cancelling prevents new items from starting;
/// in-flight items run to completion.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrates a job across a bounded worker pool: each worker pulls a
/// Pending item and runs resolve -> fetch -> validate -> tag end-to-end,
/// requeueing on transient failure up to the attempt ceiling.
pub struct Coordinator {
    resolver: Arc<dyn Resolver>,
    fetcher: Arc<dyn Fetcher>,
    post: Arc<dyn PostProcessor>,
    max_attempts: u32,
    resolve_timeout: Duration,
    fetch_timeout: Duration,
    progress: Arc<ProgressTracker>,
    cancel: CancelHandle,
}

struct WorkerCtx {
    resolver: Arc<dyn Resolver>,
    fetcher: Arc<dyn Fetcher>,
    post: Arc<dyn PostProcessor>,
    validator: Validator,
    max_attempts: u32,
    resolve_timeout: Duration,
    fetch_timeout: Duration,
    output_dir: PathBuf,
    queue: Mutex<VecDeque<DownloadItem>>,
    results: Mutex<HashMap<String, ItemOutcome>>,
    progress: Arc<ProgressTracker>,
    cancel: CancelHandle,
}

impl Coordinator {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        fetcher: Arc<dyn Fetcher>,
        post: Arc<dyn PostProcessor>,
        max_attempts: u32,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            post,
            max_attempts: max_attempts.max(1),
            resolve_timeout: Duration::from_secs(180),
            fetch_timeout: Duration::from_secs(300),
            progress: Arc::new(ProgressTracker::new()),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_timeouts(mut self, resolve_timeout: Duration, fetch_timeout: Duration) -> Self {
        self.resolve_timeout = resolve_timeout;
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn run(&self, job: DownloadJob) -> Result<JobResult> {
        tokio::fs::create_dir_all(&job.output_dir).await.map_err(|e| {
            AppError::FatalIo(format!(
                "Cannot create output directory {:?}: {}",
                job.output_dir, e
            ))
        })?;

        let total = job.items.len();
        self.progress.reset(total).await;

        let workers = job.workers.min(total).max(1);
        info!("[COORDINATOR] Starting job: {} items, {} workers", total, workers);

        let ctx = Arc::new(WorkerCtx {
            resolver: self.resolver.clone(),
            fetcher: self.fetcher.clone(),
            post: self.post.clone(),
            validator: Validator::new(job.thresholds),
            max_attempts: self.max_attempts,
            resolve_timeout: self.resolve_timeout,
            fetch_timeout: self.fetch_timeout,
            output_dir: job.output_dir,
            queue: Mutex::new(job.items.into()),
            results: Mutex::new(HashMap::with_capacity(total)),
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, ctx).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("[COORDINATOR] Worker panicked: {}", e);
            }
        }

        let outcomes = ctx.results.lock().await.clone();
        let result = JobResult { outcomes };
        info!(
            "[COORDINATOR] Job finished: {} complete, {} failed, {} cancelled",
            result.complete_count(),
            result.failed_count(),
            result.cancelled_count()
        );
        Ok(result)
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerCtx>) {
    loop {
        let item = ctx.queue.lock().await.pop_front();
        let Some(mut item) = item else { break };

        if ctx.cancel.is_cancelled() {
            item.status = ItemStatus::Cancelled;
            ctx.progress.item_cancelled(&item.id).await;
            record(&ctx, item).await;
            continue;
        }

        item.attempts += 1;
        ctx.progress
            .item_active(&item.id, "Searching for audio source")
            .await;
        debug!(
            "[COORDINATOR] Worker {} processing '{}' (attempt {}/{})",
            worker_id, item.metadata.name, item.attempts, ctx.max_attempts
        );

        match process_item(&ctx, &mut item).await {
            Ok(path) => {
                item.status = ItemStatus::Complete;
                item.output_path = Some(path);
                ctx.progress.item_complete(&item.id).await;
                info!("[COORDINATOR] Downloaded: {}", item.metadata.filename());
                record(&ctx, item).await;
            }
            Err(err) if err.is_transient() && item.attempts < ctx.max_attempts => {
                warn!(
                    "[COORDINATOR] Transient failure for '{}' (attempt {}/{}): {}",
                    item.metadata.name, item.attempts, ctx.max_attempts, err
                );
                // A failed validation points at a bad match, so the source
                // is resolved again on the next attempt.
                if matches!(err, AppError::Validation(_)) {
                    item.source = None;
                }
                item.status = ItemStatus::Pending;
                item.last_error = Some(err.to_string());
                ctx.progress
                    .item_requeued(&item.id, &format!("Retrying: {}", err))
                    .await;
                ctx.queue.lock().await.push_back(item);
            }
            Err(err) => {
                warn!(
                    "[COORDINATOR] Failed: {} - {}",
                    item.metadata.name, err
                );
                item.status = ItemStatus::Failed;
                item.last_error = Some(err.to_string());
                ctx.progress.item_failed(&item.id, &err.to_string()).await;
                record(&ctx, item).await;
            }
        }
    }
}

async fn record(ctx: &WorkerCtx, item: DownloadItem) {
    let outcome = ItemOutcome {
        status: item.status,
        title: item.metadata.name.clone(),
        path: match item.status {
            ItemStatus::Complete => item.output_path.clone(),
            _ => None,
        },
        error: item.last_error.clone(),
        attempts: item.attempts,
    };
    ctx.results.lock().await.insert(item.id.clone(), outcome);
}

/// One end-to-end attempt: resolve -> fetch -> validate -> tag, strictly
/// sequential. Returns the final output path on success.
async fn process_item(ctx: &WorkerCtx, item: &mut DownloadItem) -> Result<PathBuf> {
    let dest = ctx.output_dir.join(format!("{}.mp3", item.metadata.filename()));
    item.output_path = Some(dest.clone());

    // A valid file from an earlier run counts as done; an invalid one is
    // removed and re-fetched.
    if dest.exists() {
        let validation = ctx.validator.validate(&dest).await?;
        if validation.passed {
            info!("[COORDINATOR] Already exists: {}", item.metadata.filename());
            return Ok(dest);
        }
        tokio::fs::remove_file(&dest).await?;
    }

    item.status = ItemStatus::Resolving;
    let handle = match item.source.clone() {
        Some(handle) => handle,
        None => {
            let handle =
                tokio::time::timeout(ctx.resolve_timeout, ctx.resolver.resolve(&item.metadata))
                    .await
                    .map_err(|_| AppError::Resolve("Resolver timed out".to_string()))??;
            item.source = Some(handle.clone());
            handle
        }
    };

    item.status = ItemStatus::Fetching;
    ctx.progress.set_message(&item.id, "Downloading audio").await;
    // The fetcher bounds its own subprocess with ctx.fetch_timeout. The
    // outer timer is a backstop for a hung fetcher and must fire later,
    // otherwise dropping the future strands the fetcher's scratch files.
    let fetch_deadline = ctx.fetch_timeout.saturating_add(FETCH_TIMEOUT_GRACE);
    tokio::time::timeout(fetch_deadline, ctx.fetcher.fetch(&handle, &dest))
        .await
        .map_err(|_| AppError::Fetch("Download timed out".to_string()))??;

    item.status = ItemStatus::Validating;
    ctx.progress.set_message(&item.id, "Validating file").await;
    let validation = ctx.validator.validate(&dest).await?;
    if !validation.passed {
        // Never leave a rejected file behind.
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(AppError::Validation(validation.reason.unwrap_or_else(|| {
            "File below quality thresholds".to_string()
        })));
    }
    debug!(
        "[COORDINATOR] Validated {:?}: {} bytes, {} kbps",
        dest, validation.file_size, validation.bitrate_kbps
    );

    ctx.progress.set_message(&item.id, "Embedding metadata").await;
    if let Err(e) = ctx.post.tag(&dest, &item.metadata).await {
        warn!("[COORDINATOR] Tagging failed for {}: {}", item.metadata.name, e);
    }

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::QualityThresholds;
    use crate::search::SourceHandle;
    use crate::spotify::TrackMetadata;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn track(id: &str, name: &str) -> TrackMetadata {
        TrackMetadata {
            track_id: id.to_string(),
            name: name.to_string(),
            artist: "Test Artist".to_string(),
            album: "Test Album".to_string(),
            album_art_url: None,
            isrc: None,
            duration_ms: 200_000,
            release_date: None,
        }
    }

    fn test_thresholds() -> QualityThresholds {
        QualityThresholds {
            min_file_size_bytes: 10_000,
            min_bitrate_kbps: 0,
        }
    }

    struct StubResolver;

    #[async_trait::async_trait]
    impl Resolver for StubResolver {
        async fn resolve(&self, metadata: &TrackMetadata) -> Result<SourceHandle> {
            Ok(SourceHandle {
                url: format!("stub://{}", metadata.track_id),
                title: metadata.name.clone(),
                duration_secs: metadata.duration_ms / 1000,
                view_count: 1,
                quality_score: 0.9,
            })
        }
    }

    struct MockFetcher {
        delay: Duration,
        undersized_names: Vec<String>,
        calls: AtomicU32,
    }

    impl MockFetcher {
        fn new(delay: Duration, undersized_names: Vec<String>) -> Self {
            Self {
                delay,
                undersized_names,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, _handle: &SourceHandle, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let name = dest.to_string_lossy().to_string();
            let size = if self.undersized_names.iter().any(|n| name.contains(n.as_str())) {
                1_000
            } else {
                50_000
            };
            tokio::fs::write(dest, vec![0u8; size]).await?;
            Ok(())
        }
    }

    struct NoopPost;

    #[async_trait::async_trait]
    impl PostProcessor for NoopPost {
        async fn tag(&self, _path: &Path, _metadata: &TrackMetadata) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator(fetcher: Arc<MockFetcher>, max_attempts: u32) -> Coordinator {
        Coordinator::new(Arc::new(StubResolver), fetcher, Arc::new(NoopPost), max_attempts)
    }

    #[tokio::test]
    async fn repeated_validation_failure_exhausts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new(
            Duration::from_millis(1),
            vec!["Two".to_string()],
        ));
        let coordinator = coordinator(fetcher.clone(), 3);

        let tracks = vec![track("t1", "One"), track("t2", "Two"), track("t3", "Three")];
        let job = DownloadJob::new(tracks, dir.path().to_path_buf())
            .with_workers(1)
            .with_thresholds(test_thresholds());

        let result = coordinator.run(job).await.unwrap();

        assert_eq!(result.complete_count(), 2);
        assert_eq!(result.failed_count(), 1);

        let failed = &result.outcomes["t2"];
        assert_eq!(failed.status, ItemStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert!(failed.error.as_deref().unwrap().contains("File size"));

        // Siblings completed first try.
        assert_eq!(result.outcomes["t1"].attempts, 1);
        assert_eq!(result.outcomes["t3"].attempts, 1);

        // No output file left for the rejected item.
        assert!(dir.path().join("Test Artist - One.mp3").exists());
        assert!(!dir.path().join("Test Artist - Two.mp3").exists());
        assert!(dir.path().join("Test Artist - Three.mp3").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_run_items_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(250), vec![]));
        let coordinator = coordinator(fetcher.clone(), 3);

        let tracks = (1..=4).map(|i| track(&format!("t{}", i), &format!("Song{}", i))).collect();
        let job = DownloadJob::new(tracks, dir.path().to_path_buf())
            .with_workers(4)
            .with_thresholds(test_thresholds());

        let started = Instant::now();
        let result = coordinator.run(job).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.complete_count(), 4);
        for outcome in result.outcomes.values() {
            assert_eq!(outcome.attempts, 1);
        }
        // Serial execution would take ~1s.
        assert!(elapsed < Duration::from_millis(700), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn cancellation_stops_pending_items() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(150), vec![]));
        let coordinator = coordinator(fetcher.clone(), 3);
        let cancel = coordinator.cancel_handle();

        let tracks = vec![track("t1", "One"), track("t2", "Two"), track("t3", "Three")];
        let job = DownloadJob::new(tracks, dir.path().to_path_buf())
            .with_workers(1)
            .with_thresholds(test_thresholds());

        let run = coordinator.run(job);
        tokio::pin!(run);

        // Let the first item get in flight, then cancel.
        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                cancel.cancel();
                run.await
            }
        }
        .unwrap();

        let first = &result.outcomes["t1"];
        assert_eq!(first.status, ItemStatus::Complete);

        assert_eq!(result.cancelled_count(), 2);
        assert_eq!(result.outcomes["t2"].status, ItemStatus::Cancelled);
        assert_eq!(result.outcomes["t3"].status, ItemStatus::Cancelled);

        // Cancelled items never started, so only one fetch happened and no
        // partial files exist.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("Test Artist - Two.mp3").exists());
        assert!(!dir.path().join("Test Artist - Three.mp3").exists());
    }

    #[tokio::test]
    async fn existing_valid_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("Test Artist - One.mp3"), vec![0u8; 50_000])
            .await
            .unwrap();

        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(1), vec![]));
        let coordinator = coordinator(fetcher.clone(), 3);

        let job = DownloadJob::new(vec![track("t1", "One")], dir.path().to_path_buf())
            .with_workers(1)
            .with_thresholds(test_thresholds());

        let result = coordinator.run(job).await.unwrap();

        assert_eq!(result.complete_count(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    struct CleanupFetcher {
        marker: PathBuf,
    }

    #[async_trait::async_trait]
    impl Fetcher for CleanupFetcher {
        async fn fetch(&self, _handle: &SourceHandle, _dest: &Path) -> Result<()> {
            // Overruns the configured fetch timeout, then cleans up its
            // scratch state before reporting the failure.
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&self.marker, b"scratch removed").await?;
            Err(AppError::Fetch("download timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn slow_fetcher_cleans_up_before_the_backstop_fires() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("cleanup-marker");

        let coordinator = Coordinator::new(
            Arc::new(StubResolver),
            Arc::new(CleanupFetcher { marker: marker.clone() }),
            Arc::new(NoopPost),
            1,
        )
        .with_timeouts(Duration::from_secs(5), Duration::from_millis(50));

        let job = DownloadJob::new(vec![track("t1", "One")], dir.path().to_path_buf())
            .with_workers(1)
            .with_thresholds(test_thresholds());
        let result = coordinator.run(job).await.unwrap();

        assert_eq!(result.outcomes["t1"].status, ItemStatus::Failed);
        // The fetcher kept control past its own deadline and got to clean up.
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn unwritable_output_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        tokio::fs::write(&blocker, b"file").await.unwrap();

        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(1), vec![]));
        let coordinator = coordinator(fetcher, 3);

        let job = DownloadJob::new(vec![track("t1", "One")], blocker).with_workers(1);
        let result = coordinator.run(job).await;
        assert!(matches!(result, Err(AppError::FatalIo(_))));
    }

    #[tokio::test]
    async fn progress_counts_settle_after_job() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new(
            Duration::from_millis(1),
            vec!["Two".to_string()],
        ));
        let coordinator = coordinator(fetcher, 2);
        let progress = coordinator.progress();

        let tracks = vec![track("t1", "One"), track("t2", "Two")];
        let job = DownloadJob::new(tracks, dir.path().to_path_buf())
            .with_workers(2)
            .with_thresholds(test_thresholds());

        coordinator.run(job).await.unwrap();

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.complete, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.done(), snapshot.total());
    }
}
