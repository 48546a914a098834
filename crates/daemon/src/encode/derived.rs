//! Derived artifacts produced from a finished merge: a short preview clip and
//! still thumbnails. Both are best effort; failures are logged and dropped.

use crate::process::run_bounded;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Duration assumed for thumbnail spacing when the merged file could not be probed.
pub const FALLBACK_DURATION_SECS: f64 = 60.0;

/// Settings for derived artifact generation
#[derive(Debug, Clone)]
pub struct DerivedSettings {
    pub ffmpeg_path: PathBuf,
    pub preview_secs: u32,
    pub thumbnail_count: u32,
    pub timeout: Duration,
}

/// Whatever derived artifacts were produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedArtifacts {
    pub preview: Option<PathBuf>,
    pub thumbnails: Vec<PathBuf>,
}

/// Evenly spaced time points strictly inside `(0, duration)`.
pub fn thumbnail_time_points(duration_secs: Option<f64>, count: u32) -> Vec<f64> {
    let duration = match duration_secs {
        Some(d) if d.is_finite() && d > 0.0 => d,
        _ => FALLBACK_DURATION_SECS,
    };
    let step = duration / (count as f64 + 1.0);
    (1..=count).map(|i| step * i as f64).collect()
}

pub fn build_preview_command(ffmpeg: &Path, input: &Path, secs: u32, output: &Path) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner").arg("-i").arg(input);
    cmd.arg("-t").arg(secs.to_string());
    cmd.args(["-c:v", "libx264", "-preset", "fast", "-crf", "28", "-c:a", "aac"]);
    cmd.arg("-y").arg(output);
    cmd
}

pub fn build_thumbnail_command(ffmpeg: &Path, input: &Path, at_secs: f64, output: &Path) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner");
    cmd.arg("-ss").arg(format!("{:.3}", at_secs));
    cmd.arg("-i").arg(input);
    cmd.args(["-vframes", "1", "-q:v", "2"]);
    cmd.arg("-y").arg(output);
    cmd
}

/// Run one derivation; `Some(output)` only if the tool succeeded and left a file.
async fn derive_one(cmd: Command, output: &Path, timeout: Duration, what: &str) -> Option<PathBuf> {
    match run_bounded(cmd, timeout, None).await {
        Ok(out) if out.status.success() && non_empty(output) => {
            debug!(path = %output.display(), what, "derived artifact created");
            Some(output.to_path_buf())
        }
        Ok(out) => {
            warn!(what, status = %out.status, "derived artifact not produced");
            let _ = std::fs::remove_file(output);
            None
        }
        Err(e) => {
            warn!(what, error = %e, "derived artifact failed");
            let _ = std::fs::remove_file(output);
            None
        }
    }
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Produce the preview clip and thumbnails for `artifact` next to it.
pub async fn generate_derived(
    settings: &DerivedSettings,
    artifact: &Path,
    duration_secs: Option<f64>,
    run_id: &str,
) -> DerivedArtifacts {
    let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
    let mut derived = DerivedArtifacts::default();

    if settings.preview_secs > 0 {
        let output = dir.join(format!("preview_{}.mp4", run_id));
        let cmd = build_preview_command(&settings.ffmpeg_path, artifact, settings.preview_secs, &output);
        derived.preview = derive_one(cmd, &output, settings.timeout, "preview").await;
    }

    for (i, at) in thumbnail_time_points(duration_secs, settings.thumbnail_count)
        .into_iter()
        .enumerate()
    {
        let output = dir.join(format!("thumb_{}_{}.jpg", i + 1, run_id));
        let cmd = build_thumbnail_command(&settings.ffmpeg_path, artifact, at, &output);
        if let Some(path) = derive_one(cmd, &output, settings.timeout, "thumbnail").await {
            derived.thumbnails.push(path);
        }
    }

    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_media, write_script};

    #[test]
    fn test_time_points_evenly_spaced() {
        assert_eq!(thumbnail_time_points(Some(40.0), 3), vec![10.0, 20.0, 30.0]);
        assert_eq!(thumbnail_time_points(None, 1), vec![30.0]);
        assert_eq!(thumbnail_time_points(Some(f64::NAN), 1), vec![30.0]);
        assert!(thumbnail_time_points(Some(10.0), 0).is_empty());
    }

    #[test]
    fn test_thumbnail_command_shape() {
        let cmd = build_thumbnail_command(
            Path::new("ffmpeg"),
            Path::new("/w/m.mp4"),
            12.5,
            Path::new("/w/t.jpg"),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|p| p[0] == "-ss" && p[1] == "12.500"));
        assert!(args.windows(2).any(|p| p[0] == "-vframes" && p[1] == "1"));
        assert!(args.windows(2).any(|p| p[0] == "-q:v" && p[1] == "2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_derived_with_working_tool() {
        let dir = tempfile::tempdir().unwrap();
        // Writes its last argument, like ffmpeg writes its output.
        let ffmpeg = write_script(
            dir.path(),
            "ffmpeg",
            "for last; do :; done\nprintf derived > \"$last\"",
        );
        let artifact = write_media(dir.path(), "merged_r.mp4", 64);
        let settings = DerivedSettings {
            ffmpeg_path: ffmpeg,
            preview_secs: 30,
            thumbnail_count: 2,
            timeout: Duration::from_secs(10),
        };

        let derived = generate_derived(&settings, &artifact, Some(90.0), "r").await;

        assert!(derived.preview.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(derived.thumbnails.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_derived_failures_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exit 1");
        let artifact = write_media(dir.path(), "merged_r.mp4", 64);
        let settings = DerivedSettings {
            ffmpeg_path: ffmpeg,
            preview_secs: 30,
            thumbnail_count: 1,
            timeout: Duration::from_secs(10),
        };

        let derived = generate_derived(&settings, &artifact, None, "r").await;

        assert_eq!(derived, DerivedArtifacts::default());
    }
}
