//! Concurrency planning
//!
//! Derives the encoder and download limits from configuration and the CPU core count.

use crate::config::Config;

/// Concurrency limits derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of encoder subprocesses running at once
    pub max_concurrent_encodes: u32,
    /// Maximum number of simultaneous downloads
    pub concurrent_downloads: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan using the detected core count
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a known core count
    ///
    /// - `max_concurrent_encodes`: explicit value if non-zero, else 1 below 4 cores, 2 otherwise
    /// - `concurrent_downloads`: taken from config, at least 1
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);

        let max_concurrent_encodes = if cfg.merge.max_concurrent_encodes > 0 {
            cfg.merge.max_concurrent_encodes
        } else {
            derive_max_encodes(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_encodes,
            concurrent_downloads: (cfg.download.concurrent_downloads as u32).max(1),
        }
    }
}

/// Each ffmpeg process already uses every core, so only small machines drop to one.
fn derive_max_encodes(cores: u32) -> u32 {
    if cores < 4 {
        1
    } else {
        2
    }
}

/// Derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
