//! Compatibility analysis across a set of source videos.
//!
//! Decides whether the sources can be concatenated with stream copy or whether the
//! merge must re-encode. The rule looks at container extensions only, unless the
//! analyzer is configured to also require a single codec.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::probe::{MediaProbe, ProbeResult, Resolution};

/// Merge strategy classification for a set of sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Compatibility {
    /// Sources share a container matching the requested format.
    FastPath,
    /// Sources must be re-encoded to a uniform target.
    ReEncodeRequired { reason: String },
}

impl Compatibility {
    pub fn is_fast_path(&self) -> bool {
        matches!(self, Compatibility::FastPath)
    }
}

/// Aggregated metadata for one merge run.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub requested_format: String,
    pub containers: BTreeSet<String>,
    pub codecs: BTreeSet<String>,
    pub resolutions: BTreeSet<Resolution>,
    /// Distinct frame rates, rounded to two decimals for display.
    pub frame_rates: BTreeSet<String>,
    pub total_duration_secs: f64,
    pub total_size_bytes: u64,
    /// Number of sources whose metadata was at least partly unknown.
    pub unknown_count: usize,
    pub files: Vec<ProbeResult>,
    pub compatibility: Compatibility,
}

/// Normalise a user-supplied format: lower case, no leading dot.
pub fn normalize_format(format: &str) -> String {
    format.trim().trim_start_matches('.').to_lowercase()
}

/// Apply the fast-path rule.
///
/// Fast path requires exactly one container, equal to the requested format, and no
/// unknown metadata. With `require_single_codec` it also requires exactly one codec.
pub fn classify(
    containers: &BTreeSet<String>,
    codecs: &BTreeSet<String>,
    unknown_count: usize,
    requested_format: &str,
    require_single_codec: bool,
) -> Compatibility {
    let requested = normalize_format(requested_format);

    if unknown_count > 0 {
        return Compatibility::ReEncodeRequired {
            reason: format!("metadata unknown for {} file(s)", unknown_count),
        };
    }

    if containers.len() != 1 {
        return Compatibility::ReEncodeRequired {
            reason: format!(
                "mixed containers: {}",
                containers.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        };
    }

    if !containers.contains(&requested) {
        return Compatibility::ReEncodeRequired {
            reason: format!("container differs from requested format {}", requested),
        };
    }

    if require_single_codec && codecs.len() != 1 {
        return Compatibility::ReEncodeRequired {
            reason: format!(
                "mixed codecs: {}",
                codecs.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        };
    }

    Compatibility::FastPath
}

/// Probes every source and summarises the set.
pub struct CompatibilityAnalyzer {
    probe: Arc<dyn MediaProbe>,
    require_single_codec: bool,
}

impl CompatibilityAnalyzer {
    pub fn new(probe: Arc<dyn MediaProbe>, require_single_codec: bool) -> Self {
        Self {
            probe,
            require_single_codec,
        }
    }

    pub fn require_single_codec(&self) -> bool {
        self.require_single_codec
    }

    /// Probe `paths` concurrently and classify the set for `requested_format`.
    ///
    /// Never fails; per-file probe failures only push the result toward re-encoding.
    pub async fn analyze(&self, paths: &[PathBuf], requested_format: &str) -> AnalysisSummary {
        let files: Vec<ProbeResult> =
            join_all(paths.iter().map(|path| self.probe.probe(path))).await;

        let mut summary = summarize(files, requested_format);
        summary.compatibility = classify(
            &summary.containers,
            &summary.codecs,
            summary.unknown_count,
            &summary.requested_format,
            self.require_single_codec,
        );

        info!(
            files = summary.files.len(),
            containers = ?summary.containers,
            codecs = ?summary.codecs,
            total_bytes = summary.total_size_bytes,
            fast_path = summary.compatibility.is_fast_path(),
            "analysis complete"
        );
        summary
    }
}

/// Accumulate per-file results. Classification is filled in by the caller.
fn summarize(files: Vec<ProbeResult>, requested_format: &str) -> AnalysisSummary {
    let mut summary = AnalysisSummary {
        requested_format: normalize_format(requested_format),
        containers: BTreeSet::new(),
        codecs: BTreeSet::new(),
        resolutions: BTreeSet::new(),
        frame_rates: BTreeSet::new(),
        total_duration_secs: 0.0,
        total_size_bytes: 0,
        unknown_count: 0,
        files: Vec::new(),
        compatibility: Compatibility::ReEncodeRequired {
            reason: "not classified".to_string(),
        },
    };

    for file in &files {
        summary.total_size_bytes += file.size_bytes;
        if let Some(container) = &file.container {
            summary.containers.insert(container.clone());
        }
        if let Some(codec) = &file.codec {
            summary.codecs.insert(codec.clone());
        }
        if let Some(resolution) = file.resolution {
            summary.resolutions.insert(resolution);
        }
        if let Some(fps) = file.frame_rate {
            summary.frame_rates.insert(format!("{:.2}", fps));
        }
        summary.total_duration_secs += file.duration_secs.unwrap_or(0.0);
        if !file.metadata_known() {
            summary.unknown_count += 1;
        }
    }

    summary.files = files;
    summary
}
