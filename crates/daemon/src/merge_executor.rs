//! Merge executor
//!
//! Drives one [`MergeRun`] through validation, analysis, planning and encoding, with
//! the number of simultaneous encoder processes bounded by a semaphore.

use crate::analyze::{AnalysisSummary, CompatibilityAnalyzer};
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::{
    generate_derived, run_merge, DerivedArtifacts, DerivedSettings, EncodeError, FfmpegMergeParams,
};
use crate::manifest::write_manifest;
use crate::metrics::{RunMetrics, SharedMetrics};
use crate::plan::{MergeMethod, MergePlan, MergePlanBuilder, PlanError};
use crate::probe::MediaProbe;
use crate::queue::{MediaItem, UserId, MIN_MERGE_ITEMS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound on any outcome message shown to the user
pub const MAX_OUTCOME_CHARS: usize = 1024;

/// Error type for merge runs
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    /// Too few inputs survived validation
    #[error("only {valid} usable video(s), at least {need} required")]
    InsufficientValidItems { valid: usize, need: usize },

    /// No plan could be built for the requested output
    #[error("planning failed: {0}")]
    PlanningFailed(#[from] PlanError),

    /// The encoder exited unsuccessfully or produced no output
    #[error("encoder failed: {diagnostics}")]
    EncodeFailed {
        code: Option<i32>,
        diagnostics: String,
    },

    /// The encoder exceeded its wall-clock budget
    #[error("encoder timed out after {}s", .0.as_secs())]
    EncodeTimedOut(Duration),

    /// The run was cancelled by the user
    #[error("merge cancelled")]
    Cancelled,

    /// Scratch storage could not be prepared
    #[error("workspace error: {0}")]
    Workspace(String),
}

/// Merge run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Validating,
    Analyzing,
    Planning,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    /// Convert state to string for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Validating => "validating",
            RunState::Analyzing => "analyzing",
            RunState::Planning => "planning",
            RunState::Executing => "executing",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::TimedOut => "timed_out",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::TimedOut | RunState::Cancelled
        )
    }
}

/// One merge attempt for one user
#[derive(Debug, Clone)]
pub struct MergeRun {
    pub id: String,
    pub user_id: UserId,
    pub items: Vec<MediaItem>,
    pub requested_format: String,
    pub state: RunState,
    pub method: Option<MergeMethod>,
    pub summary: Option<AnalysisSummary>,
    pub artifact: Option<PathBuf>,
    pub derived: DerivedArtifacts,
    pub error: Option<MergeError>,
}

impl MergeRun {
    pub fn new(user_id: UserId, items: Vec<MediaItem>, requested_format: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            user_id,
            items,
            requested_format: requested_format.to_string(),
            state: RunState::Pending,
            method: None,
            summary: None,
            artifact: None,
            derived: DerivedArtifacts::default(),
            error: None,
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.items.iter().map(|i| i.size_bytes).sum()
    }

    pub fn to_metrics(&self) -> RunMetrics {
        RunMetrics {
            id: self.id.clone(),
            user_id: self.user_id,
            stage: self.state.as_str().to_string(),
            method: self.method.map(|m| m.as_str().to_string()),
            input_count: self.items.len(),
            bytes_in: self.bytes_in(),
            bytes_out: self
                .artifact
                .as_ref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0),
        }
    }

    /// Human-readable outcome, one per terminal state, at most [`MAX_OUTCOME_CHARS`].
    pub fn outcome_message(&self) -> String {
        let message = match (self.state, &self.error) {
            (RunState::Succeeded, _) => {
                let name = self
                    .artifact
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let method = self.method.map(|m| m.as_str()).unwrap_or("merge");
                format!(
                    "Merged {} videos ({}) into {}",
                    self.items.len(),
                    method,
                    name
                )
            }
            (RunState::Cancelled, _) => "Merge cancelled.".to_string(),
            // Timeouts read as failures; the state and metrics keep them apart.
            (RunState::Failed | RunState::TimedOut, Some(MergeError::EncodeTimedOut(_))) => {
                "Merge failed: the encoder did not finish and was stopped".to_string()
            }
            (RunState::Failed | RunState::TimedOut, Some(err)) => format!("Merge failed: {}", err),
            (state, _) => format!("Merge {}", state.as_str()),
        };
        truncate_chars(&message, MAX_OUTCOME_CHARS)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Settings for merge execution
#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub ffmpeg_path: PathBuf,
    pub timeout: Duration,
    pub diagnostic_tail_chars: usize,
    pub large_file_threshold_bytes: u64,
    pub require_single_codec: bool,
    pub derived: DerivedSettings,
}

impl MergeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.merge.ffmpeg_path.clone(),
            timeout: Duration::from_secs(cfg.merge.timeout_secs),
            diagnostic_tail_chars: cfg.merge.diagnostic_tail_chars,
            large_file_threshold_bytes: cfg.merge.large_file_threshold_bytes,
            require_single_codec: cfg.merge.require_single_codec,
            derived: DerivedSettings {
                ffmpeg_path: cfg.merge.ffmpeg_path.clone(),
                preview_secs: cfg.merge.preview_secs,
                thumbnail_count: cfg.merge.thumbnail_count,
                timeout: Duration::from_secs(cfg.merge.derived_timeout_secs),
            },
        }
    }
}

/// Executes merge runs with a bound on concurrent encoder subprocesses
pub struct MergeExecutor {
    semaphore: Arc<Semaphore>,
    analyzer: CompatibilityAnalyzer,
    planner: MergePlanBuilder,
    probe: Arc<dyn MediaProbe>,
    settings: MergeSettings,
    metrics: SharedMetrics,
}

impl MergeExecutor {
    pub fn new(
        plan: &ConcurrencyPlan,
        probe: Arc<dyn MediaProbe>,
        settings: MergeSettings,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(plan.max_concurrent_encodes.max(1) as usize)),
            analyzer: CompatibilityAnalyzer::new(probe.clone(), settings.require_single_codec),
            planner: MergePlanBuilder::new(settings.large_file_threshold_bytes),
            probe,
            settings,
            metrics,
        }
    }

    /// Get the number of available encoder slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Try to acquire an encoder slot without waiting
    pub fn try_acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Run `run` to a terminal state inside `work_dir`.
    ///
    /// Never returns early with an error: the outcome is recorded on the returned run.
    pub async fn execute(
        &self,
        mut run: MergeRun,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> MergeRun {
        let result = self.drive(&mut run, work_dir, cancel).await;

        match result {
            Ok(()) => {
                run.state = RunState::Succeeded;
                info!(
                    run_id = %run.id,
                    user_id = run.user_id,
                    state = run.state.as_str(),
                    artifact = ?run.artifact,
                    "merge run finished"
                );
            }
            Err(err) => {
                run.state = match err {
                    MergeError::EncodeTimedOut(_) => RunState::TimedOut,
                    MergeError::Cancelled => RunState::Cancelled,
                    _ => RunState::Failed,
                };
                error!(
                    run_id = %run.id,
                    user_id = run.user_id,
                    state = run.state.as_str(),
                    error = %err,
                    "merge run did not succeed"
                );
                run.error = Some(err);
            }
        }

        self.record_terminal(&run).await;
        run
    }

    async fn drive(
        &self,
        run: &mut MergeRun,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        self.transition(run, RunState::Validating).await;
        let valid = validate_items(&run.items).await;
        if valid.len() < MIN_MERGE_ITEMS {
            return Err(MergeError::InsufficientValidItems {
                valid: valid.len(),
                need: MIN_MERGE_ITEMS,
            });
        }
        check_cancelled(cancel)?;

        self.transition(run, RunState::Analyzing).await;
        let summary = self.analyzer.analyze(&valid, &run.requested_format).await;
        check_cancelled(cancel)?;

        self.transition(run, RunState::Planning).await;
        let plan = self.planner.build(&summary, work_dir, &run.id)?;
        run.method = Some(plan.method);
        run.summary = Some(summary);

        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| MergeError::Workspace("encoder pool closed".to_string()))?,
            _ = cancel.cancelled() => return Err(MergeError::Cancelled),
        };

        self.transition(run, RunState::Executing).await;
        let outcome = self.encode(&plan, &valid, cancel).await;
        if let Err(e) = std::fs::remove_file(&plan.manifest_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %plan.manifest_path.display(), error = %e, "failed to remove manifest");
            }
        }
        if outcome.is_err() {
            let _ = std::fs::remove_file(&plan.output_path);
        }
        outcome?;

        run.artifact = Some(plan.output_path.clone());

        let duration = self.probe.probe(&plan.output_path).await.duration_secs;
        run.derived = generate_derived(&self.settings.derived, &plan.output_path, duration, &run.id).await;
        Ok(())
    }

    async fn encode(
        &self,
        plan: &MergePlan,
        sources: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        std::fs::create_dir_all(plan.output_path.parent().unwrap_or_else(|| Path::new(".")))
            .map_err(|e| MergeError::Workspace(e.to_string()))?;
        write_manifest(&plan.manifest_path, sources)
            .map_err(|e| MergeError::Workspace(format!("manifest: {}", e)))?;

        let params = FfmpegMergeParams::from_plan(
            &self.settings.ffmpeg_path,
            plan,
            self.settings.timeout,
            self.settings.diagnostic_tail_chars,
        );
        run_merge(&params, Some(cancel)).await.map_err(|e| match e {
            EncodeError::Failed { code, diagnostics } => MergeError::EncodeFailed { code, diagnostics },
            EncodeError::TimedOut(limit) => MergeError::EncodeTimedOut(limit),
            EncodeError::Cancelled => MergeError::Cancelled,
            EncodeError::Io(e) => MergeError::EncodeFailed {
                code: None,
                diagnostics: e.to_string(),
            },
        })?;

        match std::fs::metadata(&plan.output_path) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(MergeError::EncodeFailed {
                code: Some(0),
                diagnostics: "encoder produced no output".to_string(),
            }),
        }
    }

    async fn transition(&self, run: &mut MergeRun, state: RunState) {
        run.state = state;
        info!(run_id = %run.id, user_id = run.user_id, state = state.as_str(), "merge run stage");
        let mut metrics = self.metrics.write().await;
        metrics.upsert_run(run.to_metrics());
        metrics.encoder_permits_available = self.semaphore.available_permits();
    }

    async fn record_terminal(&self, run: &MergeRun) {
        let entry = run.to_metrics();
        let mut metrics = self.metrics.write().await;
        match run.state {
            RunState::Succeeded => {
                metrics.succeeded_runs += 1;
                metrics.total_bytes_merged += entry.bytes_out;
            }
            RunState::TimedOut => metrics.timed_out_runs += 1,
            RunState::Cancelled => metrics.cancelled_runs += 1,
            _ => metrics.failed_runs += 1,
        }
        metrics.upsert_run(entry);
        metrics.encoder_permits_available = self.semaphore.available_permits();
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), MergeError> {
    if cancel.is_cancelled() {
        Err(MergeError::Cancelled)
    } else {
        Ok(())
    }
}

/// Keep items that exist and are non-empty, in order.
async fn validate_items(items: &[MediaItem]) -> Vec<PathBuf> {
    let mut valid = Vec::with_capacity(items.len());
    for item in items {
        match tokio::fs::metadata(&item.path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => valid.push(item.path.clone()),
            Ok(_) => warn!(path = %item.path.display(), "dropping empty input"),
            Err(e) => warn!(path = %item.path.display(), error = %e, "dropping missing input"),
        }
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_metrics;
    use crate::queue::MediaOrigin;
    use crate::test_support::{write_fake_ffmpeg, write_media, write_script, KnownProbe};

    fn test_plan(max_concurrent_encodes: u32) -> ConcurrencyPlan {
        ConcurrencyPlan {
            total_cores: 8,
            max_concurrent_encodes,
            concurrent_downloads: 3,
        }
    }

    fn settings(ffmpeg: PathBuf, timeout: Duration) -> MergeSettings {
        MergeSettings {
            ffmpeg_path: ffmpeg.clone(),
            timeout,
            diagnostic_tail_chars: 500,
            large_file_threshold_bytes: 1 << 30,
            require_single_codec: false,
            derived: DerivedSettings {
                ffmpeg_path: ffmpeg,
                preview_secs: 30,
                thumbnail_count: 1,
                timeout: Duration::from_secs(10),
            },
        }
    }

    fn executor(ffmpeg: PathBuf, timeout: Duration, metrics: SharedMetrics) -> MergeExecutor {
        MergeExecutor::new(&test_plan(2), Arc::new(KnownProbe), settings(ffmpeg, timeout), metrics)
    }

    fn items(dir: &Path, names: &[&str]) -> Vec<MediaItem> {
        names
            .iter()
            .map(|n| MediaItem::from_file(&write_media(dir, n, 128), MediaOrigin::LocalUpload).unwrap())
            .collect()
    }

    fn manifests_left(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".concat.txt"))
            .count()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mixed_containers_reencode_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let ffmpeg = write_fake_ffmpeg(dir.path());
        let metrics = new_shared_metrics();
        let executor = executor(ffmpeg, Duration::from_secs(10), metrics.clone());

        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mp4", "c.mkv"]), "mp4");
        let run = executor.execute(run, &work, &CancellationToken::new()).await;

        assert_eq!(run.state, RunState::Succeeded, "{:?}", run.error);
        assert_eq!(run.method, Some(MergeMethod::ReEncode));
        let artifact = run.artifact.clone().unwrap();
        assert!(artifact.exists());
        assert_eq!(artifact.extension().unwrap(), "mp4");
        assert_eq!(manifests_left(&work), 0);

        let args = std::fs::read_to_string(work.join("ffmpeg-args.log")).unwrap();
        let merge_call = args.lines().next().unwrap();
        assert!(merge_call.contains("-f concat -safe 0"));
        assert!(merge_call.contains("-c:v libx264 -preset medium -crf 23"));
        assert!(merge_call.contains("-c:a aac -b:a 128k"));

        assert!(run.derived.preview.is_some());
        assert_eq!(run.derived.thumbnails.len(), 1);

        let snapshot = metrics.read().await;
        assert_eq!(snapshot.succeeded_runs, 1);
        assert_eq!(snapshot.runs[0].stage, "succeeded");
        assert_eq!(snapshot.running_runs, 0);
        assert_eq!(snapshot.encoder_permits_available, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_matching_containers_stream_copy() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_fake_ffmpeg(dir.path());
        let executor = executor(ffmpeg, Duration::from_secs(10), new_shared_metrics());

        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mp4"]), "mp4");
        let run = executor.execute(run, dir.path(), &CancellationToken::new()).await;

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.method, Some(MergeMethod::StreamCopy));
        let args = std::fs::read_to_string(dir.path().join("ffmpeg-args.log")).unwrap();
        assert!(args.lines().next().unwrap().contains("-c copy"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_failure_reports_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "echo 'concat: Operation not permitted' 1>&2\nexit 1");
        let executor = executor(ffmpeg, Duration::from_secs(10), new_shared_metrics());

        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mkv"]), "mp4");
        let run = executor.execute(run, dir.path(), &CancellationToken::new()).await;

        assert_eq!(run.state, RunState::Failed);
        match run.error.as_ref().unwrap() {
            MergeError::EncodeFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("Operation not permitted"))
            }
            other => panic!("expected EncodeFailed, got {:?}", other),
        }
        assert!(run.artifact.is_none());
        assert_eq!(manifests_left(dir.path()), 0);
        assert!(run.outcome_message().starts_with("Merge failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exit 0");
        let executor = executor(ffmpeg, Duration::from_secs(10), new_shared_metrics());

        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mp4"]), "mp4");
        let run = executor.execute(run, dir.path(), &CancellationToken::new()).await;

        assert_eq!(run.state, RunState::Failed);
        assert!(matches!(run.error, Some(MergeError::EncodeFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_encoder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exec sleep 30");
        let metrics = new_shared_metrics();
        let executor = executor(ffmpeg, Duration::from_millis(300), metrics.clone());

        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mp4"]), "mp4");
        let run = executor.execute(run, dir.path(), &CancellationToken::new()).await;

        assert_eq!(run.state, RunState::TimedOut);
        assert_eq!(manifests_left(dir.path()), 0);
        assert!(run.outcome_message().starts_with("Merge failed"));
        assert!(!run.outcome_message().contains("timed out"));
        assert_eq!(metrics.read().await.timed_out_runs, 1);
        assert_eq!(executor.available_permits(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exec sleep 30");
        let executor = executor(ffmpeg, Duration::from_secs(30), new_shared_metrics());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mp4"]), "mp4");
        let run = executor.execute(run, dir.path(), &cancel).await;

        assert_eq!(run.state, RunState::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(run.outcome_message(), "Merge cancelled.");
    }

    #[tokio::test]
    async fn test_invalid_items_dropped_before_merge() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(PathBuf::from("ffmpeg"), Duration::from_secs(1), new_shared_metrics());
        let mut inputs = items(dir.path(), &["a.mp4"]);
        inputs.push(MediaItem::new(dir.path().join("gone.mp4"), MediaOrigin::RemoteFetch, 10));
        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        inputs.push(MediaItem::new(empty, MediaOrigin::LocalUpload, 0));

        let run = executor
            .execute(MergeRun::new(1, inputs, "mp4"), dir.path(), &CancellationToken::new())
            .await;

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(
            run.error,
            Some(MergeError::InsufficientValidItems { valid: 1, need: 2 })
        );
    }

    #[tokio::test]
    async fn test_unsupported_format_fails_planning() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(PathBuf::from("ffmpeg"), Duration::from_secs(1), new_shared_metrics());

        let run = MergeRun::new(1, items(dir.path(), &["a.mp4", "b.mp4"]), "gif");
        let run = executor.execute(run, dir.path(), &CancellationToken::new()).await;

        assert_eq!(run.state, RunState::Failed);
        assert!(matches!(run.error, Some(MergeError::PlanningFailed(_))));
    }

    #[tokio::test]
    async fn test_semaphore_permit_limiting() {
        let executor = MergeExecutor::new(
            &test_plan(2),
            Arc::new(KnownProbe),
            settings(PathBuf::from("ffmpeg"), Duration::from_secs(1)),
            new_shared_metrics(),
        );

        assert_eq!(executor.available_permits(), 2);
        let p1 = executor.try_acquire_permit();
        let p2 = executor.try_acquire_permit();
        assert!(p1.is_some() && p2.is_some());
        assert!(executor.try_acquire_permit().is_none());
        drop(p1);
        assert_eq!(executor.available_permits(), 1);
    }

    #[test]
    fn test_state_names_and_terminality() {
        assert_eq!(RunState::TimedOut.as_str(), "timed_out");
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Executing.is_terminal());
    }

    #[test]
    fn test_outcome_message_is_bounded() {
        let mut run = MergeRun::new(1, Vec::new(), "mp4");
        run.state = RunState::Failed;
        run.error = Some(MergeError::EncodeFailed {
            code: Some(1),
            diagnostics: "x".repeat(10_000),
        });
        assert_eq!(run.outcome_message().chars().count(), MAX_OUTCOME_CHARS);
    }
}
