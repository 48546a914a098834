//! Merge-and-publish pipeline
//!
//! Wires the queue, fetcher, executor, publisher and janitor together behind the
//! operations a command layer needs: queue a video, merge, clear and cancel.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

use crate::analyze::normalize_format;
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::download::{
    sanitize_file_name, DownloadError, DownloadProgress, Fetcher, HttpFetcher, SUPPORTED_EXTENSIONS,
};
use crate::janitor::{StorageStats, WorkspaceJanitor};
use crate::merge_executor::{MergeExecutor, MergeRun, MergeSettings, RunState};
use crate::metrics::SharedMetrics;
use crate::probe::FfprobeProbe;
use crate::publish::{
    CombinedPublishResult, GofileUploader, LocalOutboxDestination, PublishError, PublishMetadata,
    PublishOrchestrator, PublishStatus,
};
use crate::queue::{MediaItem, MediaOrigin, QueueError, QueueManager, UserId};
use crate::reply::{MessageId, ReplySink};
use crate::report::{render_storage_stats, FinalReport};
use crate::time_gap::{TimeGap, TooSoon};

/// Error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    TooSoon(#[from] TooSoon),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("publisher setup failed: {0}")]
    Publish(#[from] PublishError),

    #[error("unsupported video type: {0}")]
    UnsupportedType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collaborators of a [`Pipeline`]
pub struct PipelineComponents {
    pub queue: QueueManager,
    pub time_gap: TimeGap,
    pub fetcher: Arc<dyn Fetcher>,
    pub executor: MergeExecutor,
    pub publisher: PublishOrchestrator,
    pub janitor: Arc<WorkspaceJanitor>,
    pub metrics: SharedMetrics,
    pub default_format: String,
}

/// Result of one `merge` call
#[derive(Debug)]
pub struct MergeOutcome {
    pub run: MergeRun,
    pub publish: Option<CombinedPublishResult>,
    /// Final text shown to the user
    pub report: String,
}

impl MergeOutcome {
    pub fn succeeded(&self) -> bool {
        self.run.state == RunState::Succeeded
            && self.publish.as_ref().is_some_and(|p| !p.is_failed())
    }
}

pub struct Pipeline {
    queue: QueueManager,
    time_gap: TimeGap,
    fetcher: Arc<dyn Fetcher>,
    executor: MergeExecutor,
    publisher: PublishOrchestrator,
    janitor: Arc<WorkspaceJanitor>,
    metrics: SharedMetrics,
    default_format: String,
}

impl Pipeline {
    pub fn new(components: PipelineComponents) -> Self {
        Self {
            queue: components.queue,
            time_gap: components.time_gap,
            fetcher: components.fetcher,
            executor: components.executor,
            publisher: components.publisher,
            janitor: components.janitor,
            metrics: components.metrics,
            default_format: normalize_format(&components.default_format),
        }
    }

    /// Build the production pipeline: ffprobe, ffmpeg, HTTP fetcher, outbox primary
    /// and GoFile secondary.
    pub fn from_config(
        cfg: &Config,
        plan: &ConcurrencyPlan,
        metrics: SharedMetrics,
    ) -> Result<Self, PipelineError> {
        let probe = Arc::new(FfprobeProbe::new(
            cfg.probe.ffprobe_path.clone(),
            Duration::from_secs(cfg.probe.timeout_secs),
        ));
        let executor = MergeExecutor::new(plan, probe, MergeSettings::from_config(cfg), metrics.clone());

        let mut download = cfg.download.clone();
        download.concurrent_downloads = plan.concurrent_downloads as usize;
        let fetcher = Arc::new(HttpFetcher::new(&download)?);

        let publish_timeout = Duration::from_secs(cfg.publish.timeout_secs);
        let publisher = PublishOrchestrator::new(
            Arc::new(LocalOutboxDestination::new(cfg.publish.outbox_dir.clone())),
            Arc::new(GofileUploader::new(
                cfg.publish.gofile_endpoint.clone(),
                cfg.publish.gofile_token.clone(),
                publish_timeout,
            )?),
            publish_timeout,
        );

        Ok(Self::new(PipelineComponents {
            queue: QueueManager::in_memory(cfg.queue.max_videos),
            time_gap: TimeGap::new(Duration::from_secs(cfg.queue.time_gap_secs)),
            fetcher,
            executor,
            publisher,
            janitor: Arc::new(WorkspaceJanitor::from_config(cfg)),
            metrics,
            default_format: cfg.merge.default_format.clone(),
        }))
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn janitor(&self) -> Arc<WorkspaceJanitor> {
        self.janitor.clone()
    }

    pub fn default_format(&self) -> &str {
        &self.default_format
    }

    /// Request spacing gate for the command layer.
    pub fn admit(&self, user: UserId) -> Result<(), TooSoon> {
        self.time_gap.check(user)
    }

    /// Copy a local file into the user's workspace and queue it.
    pub async fn enqueue_local(&self, user: UserId, source: &Path) -> Result<usize, PipelineError> {
        let name = source
            .file_name()
            .map(|n| sanitize_file_name(&n.to_string_lossy()))
            .unwrap_or_default();
        if !has_supported_extension(&name) {
            return Err(PipelineError::UnsupportedType(name));
        }
        self.ensure_room(user).await?;

        let dir = self.janitor.user_dir(user);
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let target = crate::download::unique_path(&dir.join(format!("{}_{}", stamp, name)));
        tokio::fs::copy(source, &target).await?;

        let item = MediaItem::from_file(&target, MediaOrigin::LocalUpload)?;
        self.push(user, item).await
    }

    /// Fetch a remote video into the user's workspace and queue it.
    pub async fn enqueue_url(&self, user: UserId, url: &str) -> Result<usize, PipelineError> {
        self.ensure_room(user).await?;

        let dir = self.janitor.user_dir(user);
        let report = |p: DownloadProgress| {
            debug!(
                user_id = user,
                downloaded = p.downloaded,
                total = ?p.total,
                "download progress"
            );
        };
        let path = self.fetcher.fetch(url, &dir, Some(&report)).await?;

        let item = MediaItem::from_file(&path, MediaOrigin::RemoteFetch)?;
        self.push(user, item).await
    }

    /// Merge everything the user has queued and publish the result.
    ///
    /// Queue errors (`InsufficientItems`, `RunInProgress`) are returned; everything
    /// after the run starts ends up in the [`MergeOutcome`].
    pub async fn merge(
        &self,
        user: UserId,
        format: Option<&str>,
        reply: &dyn ReplySink,
    ) -> Result<MergeOutcome, PipelineError> {
        let (items, guard) = self.queue.begin_run(user).await?;
        self.refresh_queue_metrics().await;
        let format = format
            .map(normalize_format)
            .unwrap_or_else(|| self.default_format.clone());

        let status = send(reply, &format!("Merging {} videos into {}…", items.len(), format)).await;

        let run = MergeRun::new(user, items, &format);
        let work_dir = self.janitor.user_dir(user);
        let run = self.executor.execute(run, &work_dir, guard.cancel_token()).await;

        let (publish, report) = match (&run.state, &run.artifact) {
            (RunState::Succeeded, Some(artifact)) => {
                update(reply, status, "Uploading to both destinations…").await;
                let metadata = publish_metadata(&run, artifact);
                let publish = self.publisher.publish(artifact, &metadata).await;
                self.record_publish(&publish).await;
                let report = FinalReport {
                    file_name: &metadata.file_name,
                    duration_secs: metadata.duration_secs,
                    size_bytes: metadata.size_bytes,
                    publish: &publish,
                }
                .render();
                (Some(publish), report)
            }
            _ => (None, run.outcome_message()),
        };
        update(reply, status, &report).await;

        // Files are removed while the guard still marks the run as active.
        self.cleanup_run(&run).await;
        drop(guard);
        self.refresh_queue_metrics().await;

        Ok(MergeOutcome {
            run,
            publish,
            report,
        })
    }

    /// Empty the user's queue and reclaim their scratch files.
    pub async fn clear(&self, user: UserId) -> bool {
        let request = self.queue.clear(user).await;
        let clean = self.janitor.reclaim(request).await;
        self.refresh_queue_metrics().await;
        clean
    }

    /// Cancel the user's in-flight run, if any.
    pub fn cancel(&self, user: UserId) -> bool {
        self.queue.cancel_run(user)
    }

    /// Forget request-spacing entries that can no longer reject anything.
    pub fn prune_idle(&self) {
        self.time_gap.prune(Instant::now());
    }

    pub async fn storage_stats(&self) -> StorageStats {
        self.janitor.storage_stats().await
    }

    pub async fn storage_report(&self) -> String {
        render_storage_stats(&self.storage_stats().await)
    }

    pub async fn refresh_queue_metrics(&self) {
        let queued = self.queue.total_len().await;
        let mut metrics = self.metrics.write().await;
        metrics.queued_items = queued;
        metrics.encoder_permits_available = self.executor.available_permits();
    }

    async fn ensure_room(&self, user: UserId) -> Result<(), QueueError> {
        let max = self.queue.capacity();
        if self.queue.len(user).await >= max {
            return Err(QueueError::QueueFull { max });
        }
        Ok(())
    }

    async fn push(&self, user: UserId, item: MediaItem) -> Result<usize, PipelineError> {
        let path = item.path.clone();
        match self.queue.enqueue(user, item).await {
            Ok(position) => {
                self.refresh_queue_metrics().await;
                Ok(position)
            }
            Err(e) => {
                remove_quietly(&path).await;
                Err(e.into())
            }
        }
    }

    async fn record_publish(&self, publish: &CombinedPublishResult) {
        let mut metrics = self.metrics.write().await;
        match publish.status {
            PublishStatus::Complete => metrics.publish_complete += 1,
            PublishStatus::Partial => metrics.publish_partial += 1,
            PublishStatus::Failed => metrics.publish_failed += 1,
        }
    }

    /// Remove the run's inputs and outputs. Other files in the user's directory may
    /// belong to a download or upload still in flight and are left alone.
    async fn cleanup_run(&self, run: &MergeRun) {
        let files = run
            .items
            .iter()
            .map(|i| i.path.clone())
            .chain(run.artifact.clone())
            .chain(run.derived.preview.clone())
            .chain(run.derived.thumbnails.iter().cloned());
        for path in files {
            remove_quietly(&path).await;
        }
    }
}

fn has_supported_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

fn publish_metadata(run: &MergeRun, artifact: &Path) -> PublishMetadata {
    let summary = run.summary.as_ref();
    let resolution = summary
        .filter(|s| s.resolutions.len() == 1)
        .and_then(|s| s.resolutions.iter().next().copied());
    PublishMetadata {
        file_name: artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes: std::fs::metadata(artifact).map(|m| m.len()).unwrap_or(0),
        duration_secs: summary
            .map(|s| s.total_duration_secs)
            .filter(|d| *d > 0.0),
        resolution,
        thumbnail: run.derived.thumbnails.first().cloned(),
        caption: run.outcome_message(),
    }
}

async fn send(reply: &dyn ReplySink, text: &str) -> Option<MessageId> {
    match reply.send(text).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %e, "status message not delivered");
            None
        }
    }
}

/// Edit the status message, or send a fresh one if there is none.
async fn update(reply: &dyn ReplySink, status: Option<MessageId>, text: &str) {
    let delivered = match status {
        Some(id) => reply.edit(id, text).await,
        None => reply.send(text).await.map(|_| ()),
    };
    if let Err(e) = delivered {
        warn!(error = %e, "status update not delivered");
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove run file");
        }
    } else {
        debug!(path = %path.display(), "run file removed");
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("base", &self.janitor.base())
            .field("default_format", &self.default_format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::DerivedSettings;
    use std::path::PathBuf;
    use crate::metrics::new_shared_metrics;
    use crate::publish::PublishDestination;
    use crate::reply::BufferedReplySink;
    use crate::test_support::{set_age, write_fake_ffmpeg, write_media, write_script, KnownProbe};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(
            &self,
            url: &str,
            dest_dir: &Path,
            progress: Option<&crate::download::ProgressFn<'_>>,
        ) -> Result<PathBuf, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.ends_with(".zip") {
                return Err(DownloadError::UnsupportedType("pack.zip".to_string()));
            }
            tokio::fs::create_dir_all(dest_dir).await?;
            let path = dest_dir.join("remote.mp4");
            tokio::fs::write(&path, vec![1u8; 64]).await?;
            if let Some(report) = progress {
                report(DownloadProgress {
                    downloaded: 64,
                    total: Some(64),
                });
            }
            Ok(path)
        }
    }

    struct DownDestination;

    #[async_trait]
    impl PublishDestination for DownDestination {
        fn name(&self) -> &str {
            "gofile"
        }

        async fn publish(&self, _artifact: &Path, _metadata: &PublishMetadata) -> Result<String, PublishError> {
            Err(PublishError::Status(503))
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        sources: PathBuf,
        outbox: PathBuf,
        pipeline: Pipeline,
        metrics: SharedMetrics,
        fetcher: Arc<StaticFetcher>,
    }

    /// Writes a `.part` file, waits, then renames it into place.
    struct SlowFetcher {
        delay: Duration,
    }

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(
            &self,
            _url: &str,
            dest_dir: &Path,
            _progress: Option<&crate::download::ProgressFn<'_>>,
        ) -> Result<PathBuf, DownloadError> {
            tokio::fs::create_dir_all(dest_dir).await?;
            let part = dest_dir.join("remote.mp4.part");
            tokio::fs::write(&part, vec![1u8; 64]).await?;
            tokio::time::sleep(self.delay).await;
            let path = dest_dir.join("remote.mp4");
            tokio::fs::rename(&part, &path).await?;
            Ok(path)
        }
    }

    fn fixture_with(ffmpeg: Option<PathBuf>, gap: Duration) -> Fixture {
        fixture_full(ffmpeg, gap, None)
    }

    fn fixture_full(
        ffmpeg: Option<PathBuf>,
        gap: Duration,
        fetcher_override: Option<Arc<dyn Fetcher>>,
    ) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let sources = root.path().join("sources");
        let tools = root.path().join("tools");
        std::fs::create_dir_all(&sources).unwrap();
        std::fs::create_dir_all(&tools).unwrap();
        let ffmpeg = ffmpeg.unwrap_or_else(|| write_fake_ffmpeg(&tools));
        let outbox = root.path().join("outbox");
        let metrics = new_shared_metrics();
        let fetcher = Arc::new(StaticFetcher {
            calls: AtomicUsize::new(0),
        });

        let plan = ConcurrencyPlan {
            total_cores: 4,
            max_concurrent_encodes: 1,
            concurrent_downloads: 1,
        };
        let settings = MergeSettings {
            ffmpeg_path: ffmpeg.clone(),
            timeout: Duration::from_secs(10),
            diagnostic_tail_chars: 500,
            large_file_threshold_bytes: 1 << 30,
            require_single_codec: false,
            derived: DerivedSettings {
                ffmpeg_path: ffmpeg,
                preview_secs: 5,
                thumbnail_count: 1,
                timeout: Duration::from_secs(10),
            },
        };

        let pipeline = Pipeline::new(PipelineComponents {
            queue: QueueManager::in_memory(3),
            time_gap: TimeGap::new(gap),
            fetcher: fetcher_override.unwrap_or_else(|| fetcher.clone() as Arc<dyn Fetcher>),
            executor: MergeExecutor::new(&plan, Arc::new(KnownProbe), settings, metrics.clone()),
            publisher: PublishOrchestrator::new(
                Arc::new(LocalOutboxDestination::new(outbox.clone())),
                Arc::new(DownDestination),
                Duration::from_secs(5),
            ),
            janitor: Arc::new(WorkspaceJanitor::new(
                root.path().join("downloads"),
                Duration::from_secs(3600),
                Duration::from_secs(24 * 3600),
                Vec::new(),
            )),
            metrics: metrics.clone(),
            default_format: ".MP4".to_string(),
        });

        Fixture {
            _root: root,
            sources,
            outbox,
            pipeline,
            metrics,
            fetcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None, Duration::ZERO)
    }

    fn video_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .filter(|n| n.ends_with(".mp4") || n.ends_with(".part"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_merge_publishes_and_removes_run_files() {
        let f = fixture();
        for name in ["a.mp4", "b.mp4"] {
            let src = write_media(&f.sources, name, 128);
            f.pipeline.enqueue_local(1, &src).await.unwrap();
        }
        assert_eq!(f.pipeline.enqueue_url(1, "https://cdn.example/v.mp4").await.unwrap(), 3);
        assert_eq!(f.metrics.read().await.queued_items, 3);

        let reply = BufferedReplySink::new();
        let outcome = f.pipeline.merge(1, None, &reply).await.unwrap();

        assert_eq!(outcome.run.state, RunState::Succeeded);
        assert_eq!(outcome.run.requested_format, "mp4");
        let publish = outcome.publish.as_ref().unwrap();
        assert_eq!(publish.status, PublishStatus::Partial);
        assert!(outcome.succeeded());

        let delivered: Vec<_> = std::fs::read_dir(&f.outbox)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(delivered.iter().any(|n| n.starts_with("merged_") && n.ends_with(".mp4")));

        let messages = reply.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], outcome.report);
        assert!(outcome.report.contains("[failed] gofile"));
        assert!(outcome.report.contains("[ok] outbox"));

        assert!(video_files(&f.pipeline.janitor().user_dir(1)).is_empty());
        let metrics = f.metrics.read().await;
        assert_eq!(metrics.publish_partial, 1);
        assert_eq!(metrics.succeeded_runs, 1);
        assert_eq!(metrics.queued_items, 0);
    }

    #[tokio::test]
    async fn test_download_during_merge_survives_cleanup() {
        let slow: Arc<dyn Fetcher> = Arc::new(SlowFetcher {
            delay: Duration::from_millis(800),
        });
        let f = fixture_full(None, Duration::ZERO, Some(slow));
        for name in ["a.mp4", "b.mp4"] {
            let src = write_media(&f.sources, name, 32);
            f.pipeline.enqueue_local(10, &src).await.unwrap();
        }

        let reply = BufferedReplySink::new();
        let (outcome, queued) = tokio::join!(
            f.pipeline.merge(10, None, &reply),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.pipeline.enqueue_url(10, "https://cdn.example/remote.mp4").await
            }
        );

        assert_eq!(outcome.unwrap().run.state, RunState::Succeeded);
        assert_eq!(queued.unwrap(), 1);
        let remote = f.pipeline.janitor().user_dir(10).join("remote.mp4");
        assert!(remote.exists());
        assert_eq!(f.pipeline.queue().snapshot(10).await[0].path, remote);
    }

    #[tokio::test]
    async fn test_clear_during_run_keeps_run_inputs() {
        let tools = tempfile::tempdir().unwrap();
        let ffmpeg = write_fake_ffmpeg(tools.path());
        let f = fixture_with(Some(ffmpeg), Duration::ZERO);
        for name in ["a.mp4", "b.mp4"] {
            let src = write_media(&f.sources, name, 32);
            f.pipeline.enqueue_local(11, &src).await.unwrap();
        }
        let inputs: Vec<PathBuf> = f
            .pipeline
            .queue()
            .snapshot(11)
            .await
            .into_iter()
            .map(|item| item.path)
            .collect();
        for input in &inputs {
            set_age(input, Duration::from_secs(2 * 3600));
        }
        // Slow encoder that fails if any input disappeared while it ran.
        let checks: Vec<String> = inputs
            .iter()
            .map(|p| {
                format!(
                    "[ -e '{0}' ] || {{ echo '{0}: No such file or directory' >&2; exit 1; }}",
                    p.display()
                )
            })
            .collect();
        write_script(
            tools.path(),
            "ffmpeg",
            &format!(
                "sleep 1\n{}\nfor last; do :; done\nprintf merged > \"$last\"",
                checks.join("\n")
            ),
        );

        let reply = BufferedReplySink::new();
        let (outcome, cleared) = tokio::join!(f.pipeline.merge(11, None, &reply), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let still_there = inputs.iter().all(|p| p.exists());
            (f.pipeline.clear(11).await, still_there)
        });

        assert_eq!(outcome.unwrap().run.state, RunState::Succeeded);
        let (clean, present_before_clear) = cleared;
        assert!(clean && present_before_clear);
        // The run removes its own inputs once it is done with them.
        assert!(inputs.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_merge_needs_two_items() {
        let f = fixture();
        let src = write_media(&f.sources, "only.mp4", 16);
        f.pipeline.enqueue_local(2, &src).await.unwrap();

        let err = f
            .pipeline
            .merge(2, Some("mp4"), &BufferedReplySink::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Queue(QueueError::InsufficientItems { have: 1, need: 2 })
        ));
        assert_eq!(f.pipeline.queue().len(2).await, 1);
    }

    #[tokio::test]
    async fn test_failed_merge_reports_outcome_without_publishing() {
        let root = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(root.path(), "ffmpeg", "echo 'Invalid data found' >&2\nexit 1");
        let f = fixture_with(Some(ffmpeg), Duration::ZERO);
        for name in ["a.mp4", "b.mkv"] {
            let src = write_media(&f.sources, name, 32);
            f.pipeline.enqueue_local(3, &src).await.unwrap();
        }

        let reply = BufferedReplySink::new();
        let outcome = f.pipeline.merge(3, Some("mp4"), &reply).await.unwrap();

        assert_eq!(outcome.run.state, RunState::Failed);
        assert!(outcome.publish.is_none());
        assert!(!outcome.succeeded());
        assert!(reply.last().unwrap().contains("Invalid data found"));
        assert!(!f.outbox.exists());
        assert_eq!(f.metrics.read().await.failed_runs, 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unsupported_and_full_queue() {
        let f = fixture();
        let doc = write_media(&f.sources, "notes.txt", 8);
        assert!(matches!(
            f.pipeline.enqueue_local(4, &doc).await,
            Err(PipelineError::UnsupportedType(_))
        ));

        for i in 0..3 {
            let src = write_media(&f.sources, &format!("{}.mov", i), 8);
            f.pipeline.enqueue_local(4, &src).await.unwrap();
        }
        let extra = write_media(&f.sources, "extra.mov", 8);
        assert!(matches!(
            f.pipeline.enqueue_local(4, &extra).await,
            Err(PipelineError::Queue(QueueError::QueueFull { max: 3 }))
        ));

        // Full queue is detected before any transfer starts.
        assert!(f.pipeline.enqueue_url(4, "https://cdn.example/v.mp4").await.is_err());
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_download_error_surfaces() {
        let f = fixture();
        let err = f
            .pipeline
            .enqueue_url(5, "https://cdn.example/pack.zip")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Download(DownloadError::UnsupportedType(_))));
        assert_eq!(f.pipeline.queue().len(5).await, 0);
    }

    #[tokio::test]
    async fn test_clear_empties_queue_and_workspace() {
        let f = fixture();
        for name in ["a.mp4", "b.mp4"] {
            let src = write_media(&f.sources, name, 16);
            f.pipeline.enqueue_local(6, &src).await.unwrap();
        }
        assert!(f.pipeline.storage_stats().await.file_count >= 2);

        assert!(f.pipeline.clear(6).await);

        assert_eq!(f.pipeline.queue().len(6).await, 0);
        assert!(!f.pipeline.janitor().user_dir(6).exists());
        assert_eq!(f.pipeline.storage_stats().await.file_count, 0);
        assert!(f.pipeline.storage_report().await.starts_with("Storage: 0 B"));
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_noop() {
        let f = fixture();
        assert!(!f.pipeline.cancel(7));
    }

    #[tokio::test]
    async fn test_admit_enforces_spacing() {
        let f = fixture_with(None, Duration::from_secs(60));
        f.pipeline.admit(8).unwrap();
        let err = f.pipeline.admit(8).unwrap_err();
        assert!(err.remaining > Duration::from_secs(50));
        f.pipeline.admit(9).unwrap();
    }

    #[tokio::test]
    async fn test_prune_idle_forgets_expired_spacing() {
        let f = fixture_with(None, Duration::from_millis(50));
        f.pipeline.admit(12).unwrap();
        assert!(f.pipeline.admit(12).is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        f.pipeline.prune_idle();
        assert_eq!(f.pipeline.time_gap.tracked_users(), 0);
        f.pipeline.admit(12).unwrap();
    }
}
