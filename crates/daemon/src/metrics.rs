//! Metrics for the merge service
//!
//! Provides structs for per-run metrics, system metrics, and the shared snapshot
//! served by the metrics endpoint.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-run metrics tracking the merge state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    pub id: String,
    pub user_id: i64,
    pub stage: String,
    /// `stream-copy` or `re-encode` once planned
    pub method: Option<String>,
    pub input_count: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including runs, system, and aggregate counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub runs: Vec<RunMetrics>,
    pub system: SystemMetrics,
    /// Items waiting in user queues
    pub queued_items: usize,
    pub running_runs: usize,
    pub encoder_permits_available: usize,
    pub succeeded_runs: u64,
    pub failed_runs: u64,
    pub timed_out_runs: u64,
    pub cancelled_runs: u64,
    pub publish_complete: u64,
    pub publish_partial: u64,
    pub publish_failed: u64,
    pub total_bytes_merged: u64,
}

/// Stages counted as in flight
const ACTIVE_STAGES: &[&str] = &["validating", "analyzing", "planning", "executing"];

/// Runs kept in the snapshot after reaching a terminal stage
const MAX_FINISHED_RUNS: usize = 50;

impl MetricsSnapshot {
    /// Insert or replace the entry for `run.id` and recount active runs.
    pub fn upsert_run(&mut self, run: RunMetrics) {
        if let Some(existing) = self.runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run;
        } else {
            self.runs.push(run);
        }
        self.running_runs = self
            .runs
            .iter()
            .filter(|r| ACTIVE_STAGES.contains(&r.stage.as_str()))
            .count();
        self.trim_finished();
    }

    fn trim_finished(&mut self) {
        let finished = self
            .runs
            .iter()
            .filter(|r| !ACTIVE_STAGES.contains(&r.stage.as_str()) && r.stage != "pending")
            .count();
        let mut excess = finished.saturating_sub(MAX_FINISHED_RUNS);
        self.runs.retain(|r| {
            let finished = !ACTIVE_STAGES.contains(&r.stage.as_str()) && r.stage != "pending";
            if finished && excess > 0 {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Shared metrics state for concurrent access across service components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Current timestamp in milliseconds
pub fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
