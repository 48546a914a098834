//! Merge plan construction.
//!
//! Turns an [`AnalysisSummary`] and a requested output format into the concrete
//! encoder arguments for one run.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::analyze::{normalize_format, AnalysisSummary, Compatibility};

/// Containers the encoder is allowed to produce.
pub const SUPPORTED_FORMATS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov", "m4v"];

/// Error type for planning
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    /// No viable strategy for the requested output.
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),
}

/// How the sources are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMethod {
    StreamCopy,
    ReEncode,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::StreamCopy => "stream-copy",
            MergeMethod::ReEncode => "re-encode",
        }
    }
}

/// Re-encode parameters for one output container.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeProfile {
    pub video_codec: &'static str,
    /// Speed/quality knob: flag plus normal and large-input values.
    pub preset_flag: &'static str,
    pub preset: &'static str,
    pub large_input_preset: &'static str,
    pub quality_flag: &'static str,
    pub quality: &'static str,
    pub audio_codec: &'static str,
    pub audio_bitrate: &'static str,
    /// Extra arguments the codec needs to honour `quality`.
    pub extra: &'static [&'static str],
}

const X264_PROFILE: EncodeProfile = EncodeProfile {
    video_codec: "libx264",
    preset_flag: "-preset",
    preset: "medium",
    large_input_preset: "fast",
    quality_flag: "-crf",
    quality: "23",
    audio_codec: "aac",
    audio_bitrate: "128k",
    extra: &[],
};

const VP9_PROFILE: EncodeProfile = EncodeProfile {
    video_codec: "libvpx-vp9",
    preset_flag: "-cpu-used",
    preset: "2",
    large_input_preset: "5",
    quality_flag: "-crf",
    quality: "32",
    audio_codec: "libopus",
    audio_bitrate: "128k",
    extra: &["-b:v", "0"],
};

/// Re-encode profile for `format` (already normalised).
pub fn profile_for(format: &str) -> EncodeProfile {
    match format {
        "webm" => VP9_PROFILE,
        _ => X264_PROFILE,
    }
}

/// Concrete, per-run encoder invocation plan.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub method: MergeMethod,
    pub container: String,
    /// Arguments between the concat input and the output path.
    pub encoder_args: Vec<String>,
    pub manifest_path: PathBuf,
    pub output_path: PathBuf,
    pub large_input: bool,
}

/// Builds [`MergePlan`]s.
#[derive(Debug, Clone)]
pub struct MergePlanBuilder {
    large_file_threshold_bytes: u64,
}

impl MergePlanBuilder {
    pub fn new(large_file_threshold_bytes: u64) -> Self {
        Self {
            large_file_threshold_bytes,
        }
    }

    /// Build the plan for one run inside `work_dir`.
    ///
    /// The manifest name carries `run_id` so a manifest from an earlier run is never
    /// picked up by a later one.
    pub fn build(
        &self,
        summary: &AnalysisSummary,
        work_dir: &Path,
        run_id: &str,
    ) -> Result<MergePlan, PlanError> {
        let container = normalize_format(&summary.requested_format);
        if !SUPPORTED_FORMATS.contains(&container.as_str()) {
            return Err(PlanError::UnsupportedFormat(container));
        }

        let large_input = summary.total_size_bytes > self.large_file_threshold_bytes;
        let (method, encoder_args) = match summary.compatibility {
            Compatibility::FastPath => (
                MergeMethod::StreamCopy,
                vec!["-c".to_string(), "copy".to_string()],
            ),
            Compatibility::ReEncodeRequired { .. } => (
                MergeMethod::ReEncode,
                reencode_args(&profile_for(&container), large_input),
            ),
        };

        Ok(MergePlan {
            method,
            encoder_args,
            manifest_path: work_dir.join(format!("{}.concat.txt", run_id)),
            output_path: work_dir.join(format!("merged_{}.{}", run_id, container)),
            container,
            large_input,
        })
    }
}

fn reencode_args(profile: &EncodeProfile, large_input: bool) -> Vec<String> {
    let preset = if large_input {
        profile.large_input_preset
    } else {
        profile.preset
    };

    let mut args: Vec<String> = vec![
        "-c:v",
        profile.video_codec,
        profile.preset_flag,
        preset,
        profile.quality_flag,
        profile.quality,
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.extend(profile.extra.iter().map(|s| s.to_string()));
    args.extend(
        ["-c:a", profile.audio_codec, "-b:a", profile.audio_bitrate]
            .into_iter()
            .map(String::from),
    );
    args
}
