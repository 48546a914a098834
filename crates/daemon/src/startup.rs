//! Startup checks for vidmerge
//!
//! Provides preflight checks to verify system requirements before starting:
//! - FFmpeg and FFprobe run and report a usable version (4.0+)
//! - The download base path can be created

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest major version of ffmpeg/ffprobe accepted
pub const MIN_TOOL_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("{tool} version requirement not met: {reason}")]
    ToolVersion { tool: String, reason: String },

    #[error("workspace not usable: {0}")]
    Workspace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse the major version from `<tool> -version` output
///
/// Handles various version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffprobe version n7.0-12-gabc ..."
/// - Distro builds: "ffmpeg version 4.4.2-0ubuntu0.22.04.1 ..."
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<u32> {
    let needle = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .map(|line| line.to_lowercase())
        .find(|line| line.contains(&needle))?;

    let version_part = version_line
        .split(&needle)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let major_str = version_part
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?;

    major_str.parse().ok()
}

/// Run `<path> -version` and check the reported major version
pub fn check_tool_version(path: &Path, tool: &str, min_major: u32) -> Result<u32, StartupError> {
    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", path.display(), e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version exited with {}", path.display(), output.status),
        });
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_tool_version(&version_output, tool).ok_or_else(|| StartupError::ToolVersion {
        tool: tool.to_string(),
        reason: format!(
            "could not parse version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ),
    })?;

    if major < min_major {
        return Err(StartupError::ToolVersion {
            tool: tool.to_string(),
            reason: format!("{}.x or newer required, got {}", min_major, major),
        });
    }

    info!(tool, major, path = %path.display(), "tool available");
    Ok(major)
}

/// Make sure the download base path exists and is a directory
pub fn check_workspace(down_path: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(down_path)
        .map_err(|e| StartupError::Workspace(format!("{}: {}", down_path.display(), e)))?;
    if !down_path.is_dir() {
        return Err(StartupError::Workspace(format!(
            "{} is not a directory",
            down_path.display()
        )));
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg version
/// 2. FFprobe version
/// 3. Workspace base path
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_tool_version(&cfg.merge.ffmpeg_path, "ffmpeg", MIN_TOOL_MAJOR)?;
    check_tool_version(&cfg.probe.ffprobe_path, "ffprobe", MIN_TOOL_MAJOR)?;
    check_workspace(&cfg.workspace.down_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_tool_version(&version_output, "ffmpeg"), Some(major));
        }

        #[test]
        fn prop_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffprobe version n{}.{}-123-g{} Copyright (c) 2007-2024\nbuilt with gcc 12.2.0",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_tool_version(&version_output, "ffprobe"), Some(major));
        }
    }

    #[test]
    fn test_parse_rejects_other_tool_and_garbage() {
        assert_eq!(parse_tool_version("ffmpeg version 6.0", "ffprobe"), None);
        assert_eq!(parse_tool_version("", "ffmpeg"), None);
        assert_eq!(parse_tool_version("ffmpeg version git-2024-01-01", "ffmpeg"), None);
        assert_eq!(
            parse_tool_version("FFmpeg version 4.4.2-0ubuntu0.22.04.1", "ffmpeg"),
            Some(4)
        );
    }

    #[test]
    fn test_check_tool_version_with_fake_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_script(dir.path(), "ffmpeg-good", "echo 'ffmpeg version n7.1-3-gabc123 Copyright'");
        let old = write_script(dir.path(), "ffmpeg-old", "echo 'ffmpeg version 3.4.8'");
        let broken = write_script(dir.path(), "ffmpeg-broken", "exit 2");

        assert_eq!(check_tool_version(&good, "ffmpeg", MIN_TOOL_MAJOR).unwrap(), 7);
        assert!(matches!(
            check_tool_version(&old, "ffmpeg", MIN_TOOL_MAJOR),
            Err(StartupError::ToolVersion { .. })
        ));
        assert!(matches!(
            check_tool_version(&broken, "ffmpeg", MIN_TOOL_MAJOR),
            Err(StartupError::ToolUnavailable { .. })
        ));
        assert!(matches!(
            check_tool_version(&dir.path().join("missing"), "ffmpeg", MIN_TOOL_MAJOR),
            Err(StartupError::ToolUnavailable { .. })
        ));
    }

    #[test]
    fn test_run_startup_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.merge.ffmpeg_path = write_script(dir.path(), "ffmpeg", "echo 'ffmpeg version 6.1.1'");
        cfg.probe.ffprobe_path = write_script(dir.path(), "ffprobe", "echo 'ffprobe version 6.1.1'");
        cfg.workspace.down_path = dir.path().join("downloads/nested");

        run_startup_checks(&cfg).unwrap();
        assert!(cfg.workspace.down_path.is_dir());

        cfg.workspace.down_path = cfg.merge.ffmpeg_path.clone();
        assert!(matches!(run_startup_checks(&cfg), Err(StartupError::Workspace(_))));
    }
}
