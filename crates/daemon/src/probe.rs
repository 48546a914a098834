//! Media probing via ffprobe.
//!
//! Probing is advisory: every failure mode (missing binary, non-zero exit, timeout,
//! malformed JSON) produces a [`ProbeResult`] with unknown fields instead of an error,
//! so a single unreadable file degrades the merge strategy rather than aborting it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::process::{run_bounded, ProcessError};

/// Error type for probe parsing. Never escapes [`MediaProbe::probe`].
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run to completion.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),
}

/// Frame dimensions of the first video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Metadata for one source file. `None` means "unknown".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub path: PathBuf,
    /// Format-level duration in seconds.
    pub duration_secs: Option<f64>,
    /// Codec of the first video stream (e.g. "h264", "hevc").
    pub codec: Option<String>,
    pub resolution: Option<Resolution>,
    /// Frames per second, evaluated from the `num/den` ratio.
    pub frame_rate: Option<f64>,
    /// Lower-case file extension without the dot.
    pub container: Option<String>,
    pub size_bytes: u64,
}

impl ProbeResult {
    /// A result carrying only what the filesystem knows about the file.
    pub fn unknown(path: &Path, size_bytes: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            duration_secs: None,
            codec: None,
            resolution: None,
            frame_rate: None,
            container: container_of(path),
            size_bytes,
        }
    }

    /// Whether the prober supplied everything the analyzer relies on.
    pub fn metadata_known(&self) -> bool {
        self.duration_secs.is_some()
            && self.codec.is_some()
            && self.resolution.is_some()
            && self.container.is_some()
    }
}

/// Lower-case extension of `path` without the leading dot.
pub fn container_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parse a frame rate given as `num/den` (or a plain number).
///
/// A zero denominator, a negative or non-finite value, or anything unparsable is unknown.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let value = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };

    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Parses ffprobe JSON output into a ProbeResult for `path`.
pub fn parse_ffprobe_output(
    json_str: &str,
    path: &Path,
    size_bytes: u64,
) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let mut result = ProbeResult::unknown(path, size_bytes);

    result.duration_secs = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    if let Some(stream) = video {
        result.codec = stream
            .codec_name
            .filter(|c| !c.is_empty())
            .map(|c| c.to_lowercase());
        result.resolution = match (stream.width, stream.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(Resolution { width, height })
            }
            _ => None,
        };
        result.frame_rate = stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate));
    }

    Ok(result)
}

/// Capability to extract metadata from one media file.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Probe `path`. Never fails: unknown fields signal a degraded probe.
    async fn probe(&self, path: &Path) -> ProbeResult;
}

/// [`MediaProbe`] backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    async fn try_probe(&self, path: &Path, size_bytes: u64) -> Result<ProbeResult, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path);

        let output = run_bounded(cmd, self.timeout, None)
            .await
            .map_err(|e: ProcessError| ProbeError::FfprobeFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                output.stderr_lossy().trim()
            )));
        }

        parse_ffprobe_output(&output.stdout_lossy(), path, size_bytes)
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> ProbeResult {
        let size_bytes = tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        match self.try_probe(path, size_bytes).await {
            Ok(result) => {
                if !result.metadata_known() {
                    warn!(path = %path.display(), "probe degraded: incomplete metadata");
                }
                result
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "probe degraded: metadata unknown");
                ProbeResult::unknown(path, size_bytes)
            }
        }
    }
}
