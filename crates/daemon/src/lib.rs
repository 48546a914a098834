//! vidmerge
//!
//! Merges a user's queued videos with ffmpeg and publishes the result to two
//! destinations at once, with queue, workspace and metrics management around it.

pub mod analyze;
pub mod concurrency;
pub mod daemon;
pub mod download;
pub mod encode;
pub mod janitor;
pub mod manifest;
pub mod merge_executor;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod process;
pub mod publish;
pub mod queue;
pub mod reply;
pub mod report;
pub mod startup;
pub mod time_gap;

#[cfg(test)]
mod test_support;

pub use vidmerge_config as config;
pub use vidmerge_config::Config;
pub use analyze::{AnalysisSummary, Compatibility, CompatibilityAnalyzer};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use download::{is_direct_video_url, DownloadError, Fetcher, HttpFetcher};
pub use encode::{build_merge_command, run_merge, EncodeError, FfmpegMergeParams};
pub use janitor::{StorageStats, WorkspaceJanitor};
pub use merge_executor::{MergeError, MergeExecutor, MergeRun, MergeSettings, RunState};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, MetricsSnapshot, RunMetrics, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use pipeline::{MergeOutcome, Pipeline, PipelineComponents, PipelineError};
pub use plan::{MergeMethod, MergePlan, MergePlanBuilder, PlanError};
pub use probe::{FfprobeProbe, MediaProbe, ProbeResult};
pub use publish::{
    CombinedPublishResult, PublishDestination, PublishError, PublishOrchestrator, PublishResult,
    PublishStatus,
};
pub use queue::{MediaItem, MediaOrigin, QueueError, QueueManager, QueueStore, UserId};
pub use reply::{LogReplySink, ReplySink};
pub use startup::{run_startup_checks, StartupError};
