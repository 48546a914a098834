//! Human-readable summaries sent back to the user

use std::fmt::Write;

use crate::janitor::StorageStats;
use crate::publish::{CombinedPublishResult, PublishResult, PublishStatus};

/// Format a byte count with binary units, e.g. `1.50 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format seconds as `1h 2m 3s`, dropping leading zero components.
pub fn format_duration(secs: f64) -> String {
    if !secs.is_finite() || secs <= 0.0 {
        return "0s".to_string();
    }
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m {}s", m, s),
        _ => format!("{}h {}m {}s", h, m, s),
    }
}

/// Everything the final message reports about a published merge
#[derive(Debug, Clone)]
pub struct FinalReport<'a> {
    pub file_name: &'a str,
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    pub publish: &'a CombinedPublishResult,
}

impl FinalReport<'_> {
    pub fn render(&self) -> String {
        let heading = match self.publish.status {
            PublishStatus::Complete => "Merge and upload complete",
            PublishStatus::Partial => "Merge complete, one upload failed",
            PublishStatus::Failed => "Merge complete, both uploads failed",
        };
        let duration = self
            .duration_secs
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string());

        let mut out = String::new();
        let _ = writeln!(out, "{}", heading);
        let _ = writeln!(out);
        let _ = writeln!(out, "File: {}", self.file_name);
        let _ = writeln!(out, "Duration: {}", duration);
        let _ = writeln!(out, "Size: {}", human_bytes(self.size_bytes));
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", destination_line(&self.publish.primary));
        let _ = write!(out, "{}", destination_line(&self.publish.secondary));
        out
    }
}

fn destination_line(result: &PublishResult) -> String {
    match (result.success, &result.locator, &result.error) {
        (true, Some(locator), _) => format!("[ok] {}: {}", result.destination, locator),
        (true, None, _) => format!("[ok] {}", result.destination),
        (false, _, Some(error)) => format!("[failed] {}: {}", result.destination, error),
        (false, _, None) => format!("[failed] {}: unknown error", result.destination),
    }
}

pub fn render_storage_stats(stats: &StorageStats) -> String {
    format!(
        "Storage: {} in {} file(s) across {} user director{}",
        human_bytes(stats.total_bytes),
        stats.file_count,
        stats.user_dirs,
        if stats.user_dirs == 1 { "y" } else { "ies" }
    )
}
