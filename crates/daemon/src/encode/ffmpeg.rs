//! ffmpeg concat encoder
//!
//! Builds and executes the concat-demuxer invocation for a [`MergePlan`].

use crate::plan::MergePlan;
use crate::process::{run_bounded, tail_chars, ProcessError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with non-zero status
    #[error("ffmpeg failed with exit code {code:?}: {diagnostics}")]
    Failed {
        code: Option<i32>,
        /// Tail of the encoder's stderr
        diagnostics: String,
    },

    /// ffmpeg exceeded its wall-clock budget and was killed
    #[error("ffmpeg exceeded {}s and was killed", .0.as_secs())]
    TimedOut(Duration),

    /// The run was cancelled and ffmpeg was killed
    #[error("ffmpeg cancelled")]
    Cancelled,

    /// ffmpeg could not be started or awaited
    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<ProcessError> for EncodeError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Spawn(e) | ProcessError::Io(e) => EncodeError::Io(e),
            ProcessError::TimedOut { limit, .. } => EncodeError::TimedOut(limit),
            ProcessError::Cancelled => EncodeError::Cancelled,
        }
    }
}

/// Parameters for one ffmpeg merge invocation
#[derive(Debug, Clone)]
pub struct FfmpegMergeParams {
    /// Path to the ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Concat manifest listing the sources
    pub manifest_path: PathBuf,
    /// Arguments selecting stream copy or the re-encode profile
    pub encoder_args: Vec<String>,
    /// Destination file, overwritten if present
    pub output_path: PathBuf,
    /// Wall-clock budget for the subprocess
    pub timeout: Duration,
    /// Characters of stderr kept on failure
    pub diagnostic_tail_chars: usize,
}

impl FfmpegMergeParams {
    pub fn from_plan(
        ffmpeg_path: &Path,
        plan: &MergePlan,
        timeout: Duration,
        diagnostic_tail_chars: usize,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_path_buf(),
            manifest_path: plan.manifest_path.clone(),
            encoder_args: plan.encoder_args.clone(),
            output_path: plan.output_path.clone(),
            timeout,
            diagnostic_tail_chars,
        }
    }
}

/// Build the concat merge command
///
/// `ffmpeg -hide_banner -f concat -safe 0 -i <manifest> <args> -y <output>`
pub fn build_merge_command(params: &FfmpegMergeParams) -> Command {
    let mut cmd = Command::new(&params.ffmpeg_path);

    cmd.arg("-hide_banner");
    cmd.arg("-f").arg("concat");
    // Manifest entries are absolute paths.
    cmd.arg("-safe").arg("0");
    cmd.arg("-i").arg(&params.manifest_path);
    cmd.args(&params.encoder_args);
    cmd.arg("-y").arg(&params.output_path);

    cmd
}

/// Execute a merge and wait for it within the configured budget
///
/// # Returns
/// * `Ok(())` - ffmpeg exited with status 0
/// * `Err(EncodeError)` - non-zero exit, timeout, cancellation or spawn failure
pub async fn run_merge(
    params: &FfmpegMergeParams,
    cancel: Option<&CancellationToken>,
) -> Result<(), EncodeError> {
    let cmd = build_merge_command(params);
    debug!(output = %params.output_path.display(), args = ?params.encoder_args, "starting ffmpeg");

    let output = run_bounded(cmd, params.timeout, cancel).await?;

    if output.status.success() {
        info!(output = %params.output_path.display(), "ffmpeg finished");
        Ok(())
    } else {
        let mut diagnostics = tail_chars(&output.stderr_lossy(), params.diagnostic_tail_chars);
        if diagnostics.is_empty() {
            diagnostics = format!("ffmpeg exited with {}", output.status);
        }
        Err(EncodeError::Failed {
            code: output.status.code(),
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use proptest::prelude::*;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn params(ffmpeg: PathBuf, dir: &Path, timeout: Duration) -> FfmpegMergeParams {
        FfmpegMergeParams {
            ffmpeg_path: ffmpeg,
            manifest_path: dir.join("r.concat.txt"),
            encoder_args: vec!["-c".into(), "copy".into()],
            output_path: dir.join("out.mp4"),
            timeout,
            diagnostic_tail_chars: 500,
        }
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_/.-]{1,50}").unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_merge_command_shape(
            manifest in path_strategy(),
            output in path_strategy(),
        ) {
            let params = FfmpegMergeParams {
                ffmpeg_path: PathBuf::from("ffmpeg"),
                manifest_path: PathBuf::from(&manifest),
                encoder_args: vec!["-c:v".into(), "libx264".into()],
                output_path: PathBuf::from(&output),
                timeout: Duration::from_secs(1),
                diagnostic_tail_chars: 500,
            };
            let args = get_command_args(&build_merge_command(&params));

            prop_assert_eq!(&args[0], "-hide_banner");
            prop_assert!(has_flag_with_value(&args, "-f", "concat"));
            prop_assert!(has_flag_with_value(&args, "-safe", "0"));
            prop_assert!(has_flag_with_value(&args, "-i", &manifest));
            prop_assert!(has_flag_with_value(&args, "-c:v", "libx264"));
            prop_assert_eq!(&args[args.len() - 2], "-y");
            prop_assert_eq!(&args[args.len() - 1], &output);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(
            dir.path(),
            "ffmpeg",
            "echo 'Invalid data found when processing input' 1>&2\nexit 1",
        );

        let err = run_merge(&params(ffmpeg, dir.path(), Duration::from_secs(10)), None)
            .await
            .unwrap_err();

        match err {
            EncodeError::Failed { code, diagnostics } => {
                assert_eq!(code, Some(1));
                assert!(diagnostics.contains("Invalid data"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_failure_still_has_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exit 2");

        let err = run_merge(&params(ffmpeg, dir.path(), Duration::from_secs(10)), None)
            .await
            .unwrap_err();

        match err {
            EncodeError::Failed { diagnostics, .. } => assert!(!diagnostics.is_empty()),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_encoder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_script(dir.path(), "ffmpeg", "exec sleep 30");

        let start = std::time::Instant::now();
        let err = run_merge(&params(ffmpeg, dir.path(), Duration::from_millis(300)), None)
            .await
            .unwrap_err();

        assert!(matches!(err, EncodeError::TimedOut(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
