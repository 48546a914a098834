//! Workspace janitor
//!
//! Reclaims per-user scratch directories under the download base path, either on
//! request after a run or on a fixed schedule. Every operation is idempotent and a
//! missing directory counts as already clean.

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::queue::{ReclaimRequest, UserId};

/// Transient files younger than this are left alone by the temp sweep, so an
/// in-progress download or encode does not lose its working file.
pub const TEMP_GRACE: Duration = Duration::from_secs(15 * 60);

/// Translate a `*`/`?` wildcard into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

/// Usage of the download base path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total_bytes: u64,
    pub file_count: u64,
    pub user_dirs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkspaceJanitor {
    base: PathBuf,
    retention: Duration,
    stale_after: Duration,
    temp_patterns: Vec<String>,
}

impl WorkspaceJanitor {
    pub fn new(
        base: impl Into<PathBuf>,
        retention: Duration,
        stale_after: Duration,
        temp_patterns: Vec<String>,
    ) -> Self {
        Self {
            base: base.into(),
            retention,
            stale_after,
            temp_patterns,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.workspace.down_path.clone(),
            Duration::from_secs(cfg.workspace.retention_secs),
            Duration::from_secs(cfg.workspace.stale_after_secs),
            cfg.workspace.temp_patterns.clone(),
        )
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Scratch directory of one user
    pub fn user_dir(&self, user: UserId) -> PathBuf {
        self.base.join(user.to_string())
    }

    /// Remove the user's whole tree, or with `keep_recent` only files older than
    /// the retention window. Returns false only if something could not be removed.
    pub async fn reclaim_user(&self, user: UserId, keep_recent: bool) -> bool {
        self.reclaim(ReclaimRequest {
            user_id: user,
            keep_recent,
            protected: Vec::new(),
        })
        .await
    }

    /// Carry out a [`ReclaimRequest`]; protected paths always survive.
    pub async fn reclaim(&self, request: ReclaimRequest) -> bool {
        let ReclaimRequest {
            user_id: user,
            keep_recent,
            protected,
        } = request;
        let keep_recent = keep_recent || !protected.is_empty();
        let dir = self.user_dir(user);
        let retention = self.retention;
        let outcome = tokio::task::spawn_blocking(move || {
            if keep_recent {
                remove_older_than(&dir, retention, &protected)
            } else {
                remove_tree(&dir)
            }
        })
        .await;

        match outcome {
            Ok(clean) => {
                info!(user_id = user, keep_recent, clean, "user workspace reclaimed");
                clean
            }
            Err(e) => {
                warn!(user_id = user, error = %e, "workspace reclaim task failed");
                false
            }
        }
    }

    /// Remove transient files matching `patterns` anywhere under the base path.
    pub async fn sweep_temp(&self, patterns: &[String]) -> usize {
        let matchers: Vec<Regex> = patterns
            .iter()
            .filter_map(|p| match wildcard_regex(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid temp pattern");
                    None
                }
            })
            .collect();
        let base = self.base.clone();

        let removed = tokio::task::spawn_blocking(move || sweep_matching(&base, &matchers, TEMP_GRACE))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "temp sweep task failed");
                0
            });
        info!(removed, "temp sweep finished");
        removed
    }

    /// Remove user directories whose modification time is older than `max_age`.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let base = self.base.clone();
        let removed = tokio::task::spawn_blocking(move || remove_stale_dirs(&base, max_age))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "stale sweep task failed");
                0
            });
        info!(removed, "stale sweep finished");
        removed
    }

    pub async fn storage_stats(&self) -> StorageStats {
        let base = self.base.clone();
        tokio::task::spawn_blocking(move || storage_stats(&base))
            .await
            .unwrap_or_default()
    }

    /// Sweep temp files then stale directories every `interval` until `shutdown` fires.
    ///
    /// `on_tick` runs after each sweep, for in-memory state that ages out on the same
    /// schedule.
    pub async fn run_scheduler<F>(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
        on_tick: F,
    ) where
        F: Fn() + Send + 'static,
    {
        info!(interval_secs = interval.as_secs(), "janitor scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => break,
            }
            let temp = self.sweep_temp(&self.temp_patterns).await;
            let stale = self.sweep_stale(self.stale_after).await;
            on_tick();
            debug!(temp, stale, "scheduled sweep complete");
        }
        info!("janitor scheduler stopped");
    }
}

fn remove_tree(dir: &Path) -> bool {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to remove directory");
            false
        }
    }
}

fn age_of(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

fn remove_older_than(dir: &Path, retention: Duration, protected: &[PathBuf]) -> bool {
    if !dir.exists() {
        return true;
    }
    let now = SystemTime::now();
    let mut clean = true;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if protected.iter().any(|p| p == path) {
            continue;
        }
        if age_of(path, now).is_some_and(|age| age > retention) {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove old file");
                clean = false;
            } else {
                debug!(path = %path.display(), "removed old file");
            }
        }
    }
    clean
}

fn sweep_matching(base: &Path, matchers: &[Regex], grace: Duration) -> usize {
    if !base.exists() || matchers.is_empty() {
        return 0;
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in WalkDir::new(base).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !matchers.iter().any(|re| re.is_match(&name)) {
            continue;
        }
        let path = entry.path();
        if age_of(path, now).is_some_and(|age| age < grace) {
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed temp file");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
        }
    }
    removed
}

fn remove_stale_dirs(base: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if age_of(&path, now).is_some_and(|age| age > max_age) && remove_tree(&path) {
            info!(path = %path.display(), "removed stale user directory");
            removed += 1;
        }
    }
    removed
}

fn storage_stats(base: &Path) -> StorageStats {
    let mut stats = StorageStats::default();
    if !base.exists() {
        return stats;
    }
    for entry in WalkDir::new(base).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            stats.file_count += 1;
            stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        } else if entry.file_type().is_dir() && entry.depth() == 1 {
            stats.user_dirs += 1;
        }
    }
    stats
}
