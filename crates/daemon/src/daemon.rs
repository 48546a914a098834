//! Daemon startup and background tasks for vidmerge
//!
//! Provides the entry points used by the binary: one-shot merges and the long-running
//! service with the janitor scheduler and metrics endpoint.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::download::is_direct_video_url;
use crate::metrics::{collect_system_metrics, new_shared_metrics, timestamp_ms, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::pipeline::{MergeOutcome, Pipeline, PipelineError};
use crate::queue::UserId;
use crate::reply::ReplySink;
use crate::startup::{run_startup_checks, StartupError};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Pipeline operation failed
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),

    /// Interrupted before a merge run started
    #[error("interrupted before the merge started")]
    Interrupted,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    pipeline: Arc<Pipeline>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides and validate
    /// 3. Run startup checks (ffmpeg, ffprobe, workspace)
    /// 4. Derive concurrency plan and build the pipeline
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg/ffprobe are not installed.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();
        let pipeline = Pipeline::from_config(&config, &concurrency_plan, metrics.clone())?;
        info!(
            max_concurrent_encodes = concurrency_plan.max_concurrent_encodes,
            concurrent_downloads = concurrency_plan.concurrent_downloads,
            down_path = %config.workspace.down_path.display(),
            "daemon initialized"
        );

        Ok(Self {
            config,
            concurrency_plan,
            metrics,
            pipeline: Arc::new(pipeline),
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    /// Queue every input for `user`, then merge and publish.
    ///
    /// Inputs that look like links are fetched; everything else is read as a local path.
    /// The whole call counts as one request against the user's time gap.
    pub async fn merge_inputs(
        &self,
        user: UserId,
        format: Option<&str>,
        inputs: &[String],
        reply: &dyn ReplySink,
    ) -> Result<MergeOutcome, DaemonError> {
        self.merge_inputs_until(user, format, inputs, reply, std::future::pending())
            .await
    }

    /// [`Daemon::merge_inputs`] that stops when `interrupt` resolves.
    ///
    /// A running merge is cancelled and still reported through its outcome; before
    /// the run starts, the queue is cleared and `Interrupted` returned.
    pub async fn merge_inputs_until<F>(
        &self,
        user: UserId,
        format: Option<&str>,
        inputs: &[String],
        reply: &dyn ReplySink,
        interrupt: F,
    ) -> Result<MergeOutcome, DaemonError>
    where
        F: Future<Output = ()>,
    {
        self.pipeline.admit(user).map_err(PipelineError::from)?;

        let work = self.queue_and_merge(user, format, inputs, reply);
        tokio::pin!(work, interrupt);
        tokio::select! {
            outcome = &mut work => outcome,
            _ = &mut interrupt => {
                if self.pipeline.cancel(user) {
                    warn!(user_id = user, "interrupted, cancelling the running merge");
                    work.await
                } else {
                    warn!(user_id = user, "interrupted while queueing inputs");
                    self.pipeline.clear(user).await;
                    Err(DaemonError::Interrupted)
                }
            }
        }
    }

    async fn queue_and_merge(
        &self,
        user: UserId,
        format: Option<&str>,
        inputs: &[String],
        reply: &dyn ReplySink,
    ) -> Result<MergeOutcome, DaemonError> {
        for input in inputs {
            let position = if is_direct_video_url(input) {
                self.pipeline.enqueue_url(user, input).await
            } else {
                self.pipeline.enqueue_local(user, Path::new(input)).await
            };
            match position {
                Ok(position) => info!(user_id = user, position, input = %input, "input queued"),
                Err(e) => {
                    self.pipeline.clear(user).await;
                    return Err(e.into());
                }
            }
        }
        Ok(self.pipeline.merge(user, format, reply).await?)
    }

    /// Start the metrics HTTP server
    pub fn start_metrics_server(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let bind = self.config.metrics.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &bind, shutdown).await {
                error!(error = %e, "metrics server error");
            }
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically updates system metrics and queue totals in the shared state.
    pub fn start_metrics_updater(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            loop {
                let system_metrics = collect_system_metrics();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system_metrics;
                    snapshot.timestamp_unix_ms = timestamp_ms();
                }
                pipeline.refresh_queue_metrics().await;

                tokio::select! {
                    _ = tokio::time::sleep(METRICS_REFRESH) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Start the scheduled workspace sweep; each tick also prunes request spacing.
    pub fn start_janitor(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let janitor = self.pipeline.janitor();
        let pipeline = self.pipeline.clone();
        let interval = Duration::from_secs(self.config.workspace.sweep_interval_secs.max(1));
        tokio::spawn(janitor.run_scheduler(interval, shutdown, move || pipeline.prune_idle()))
    }

    /// Run the daemon with all background tasks until `shutdown` fires
    pub async fn run_with_server(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let handles = [
            self.start_metrics_server(shutdown.clone()),
            self.start_metrics_updater(shutdown.clone()),
            self.start_janitor(shutdown.clone()),
        ];
        info!(bind = %self.config.metrics.bind, "daemon running");

        shutdown.cancelled().await;
        for handle in handles {
            handle
                .await
                .map_err(|e| DaemonError::Server(format!("background task failed: {}", e)))?;
        }
        info!("daemon stopped");
        Ok(())
    }
}
