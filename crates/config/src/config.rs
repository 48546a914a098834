//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Per-user queue limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of items a user may queue (default 5)
    #[serde(default = "default_max_videos")]
    pub max_videos: usize,
    /// Minimum spacing between two requests from the same user, in seconds
    #[serde(default = "default_time_gap_secs")]
    pub time_gap_secs: u64,
}

fn default_max_videos() -> usize {
    5
}

fn default_time_gap_secs() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_videos: default_max_videos(),
            time_gap_secs: default_time_gap_secs(),
        }
    }
}

/// Scratch storage layout and reclamation policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    /// Base directory holding one sub-directory per user
    #[serde(default = "default_down_path")]
    pub down_path: PathBuf,
    /// Files newer than this survive a `keep_recent` reclamation
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// User directories untouched for longer than this are swept
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Interval between scheduled sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// File name patterns treated as orphaned scratch files
    #[serde(default = "default_temp_patterns")]
    pub temp_patterns: Vec<String>,
}

fn default_down_path() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_stale_after_secs() -> u64 {
    24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_temp_patterns() -> Vec<String> {
    ["*.tmp", "*.temp", "input.txt", "temp_*", "*.part", "*.concat.txt"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            down_path: default_down_path(),
            retention_secs: default_retention_secs(),
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            temp_patterns: default_temp_patterns(),
        }
    }
}

/// Prober invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Per-file probe budget in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Encoder invocation and merge strategy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Hard wall-clock budget for one merge, in seconds
    #[serde(default = "default_merge_timeout_secs")]
    pub timeout_secs: u64,
    /// Above this total input size the re-encode preset shifts to `fast`
    #[serde(default = "default_large_file_threshold_bytes")]
    pub large_file_threshold_bytes: u64,
    /// Also require a single known codec before allowing stream copy
    #[serde(default)]
    pub require_single_codec: bool,
    /// Simultaneous encoder subprocesses (0 = derive from core count)
    #[serde(default)]
    pub max_concurrent_encodes: u32,
    #[serde(default = "default_format")]
    pub default_format: String,
    /// Length of the preview clip cut from a finished merge
    #[serde(default = "default_preview_secs")]
    pub preview_secs: u32,
    #[serde(default = "default_thumbnail_count")]
    pub thumbnail_count: u32,
    /// Budget for each preview/thumbnail subprocess
    #[serde(default = "default_derived_timeout_secs")]
    pub derived_timeout_secs: u64,
    /// Encoder diagnostics are truncated to this many trailing characters
    #[serde(default = "default_diagnostic_tail_chars")]
    pub diagnostic_tail_chars: usize,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_merge_timeout_secs() -> u64 {
    3600
}

fn default_large_file_threshold_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_format() -> String {
    "mp4".to_string()
}

fn default_preview_secs() -> u32 {
    30
}

fn default_thumbnail_count() -> u32 {
    1
}

fn default_derived_timeout_secs() -> u64 {
    120
}

fn default_diagnostic_tail_chars() -> usize {
    500
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            timeout_secs: default_merge_timeout_secs(),
            large_file_threshold_bytes: default_large_file_threshold_bytes(),
            require_single_codec: false,
            max_concurrent_encodes: 0,
            default_format: default_format(),
            preview_secs: default_preview_secs(),
            thumbnail_count: default_thumbnail_count(),
            derived_timeout_secs: default_derived_timeout_secs(),
            diagnostic_tail_chars: default_diagnostic_tail_chars(),
        }
    }
}

/// Remote fetch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    /// Simultaneous remote fetches across all users
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_concurrent_downloads() -> usize {
    3
}

fn default_max_download_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (vidmerge/0.1)".to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: default_concurrent_downloads(),
            max_download_bytes: default_max_download_bytes(),
            timeout_secs: default_download_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Publish destinations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Multipart upload endpoint of the hosting service
    #[serde(default = "default_gofile_endpoint")]
    pub gofile_endpoint: String,
    /// Account token sent with uploads when present
    #[serde(default)]
    pub gofile_token: Option<String>,
    #[serde(default = "default_publish_timeout_secs")]
    pub timeout_secs: u64,
    /// Directory the local primary destination delivers into
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
}

fn default_gofile_endpoint() -> String {
    "https://upload.gofile.io/uploadfile".to_string()
}

fn default_publish_timeout_secs() -> u64 {
    600
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("./outbox")
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            gofile_endpoint: default_gofile_endpoint(),
            gofile_token: None,
            timeout_secs: default_publish_timeout_secs(),
            outbox_dir: default_outbox_dir(),
        }
    }
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind: default_metrics_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn parse_bool(val: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognised variables:
    /// - MAX_VIDEOS -> queue.max_videos
    /// - TIME_GAP -> queue.time_gap_secs
    /// - DOWN_PATH -> workspace.down_path
    /// - FFMPEG_PATH / FFPROBE_PATH -> merge.ffmpeg_path / probe.ffprobe_path
    /// - MERGE_TIMEOUT_SECS -> merge.timeout_secs
    /// - MERGE_REQUIRE_SINGLE_CODEC -> merge.require_single_codec
    /// - MAX_CONCURRENT_ENCODES -> merge.max_concurrent_encodes
    /// - CONCURRENT_DOWNLOADS, MAX_DOWNLOAD_SIZE, DOWNLOAD_TIMEOUT -> download.*
    /// - GOFILE_ENDPOINT, GOFILE_API_TOKEN -> publish.*
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MAX_VIDEOS") {
            if let Ok(max) = val.parse::<usize>() {
                self.queue.max_videos = max;
            }
        }

        if let Ok(val) = env::var("TIME_GAP") {
            if let Ok(gap) = val.parse::<u64>() {
                self.queue.time_gap_secs = gap;
            }
        }

        if let Ok(val) = env::var("DOWN_PATH") {
            if !val.is_empty() {
                self.workspace.down_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            if !val.is_empty() {
                self.merge.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FFPROBE_PATH") {
            if !val.is_empty() {
                self.probe.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("MERGE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.merge.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("MERGE_REQUIRE_SINGLE_CODEC") {
            if let Some(strict) = parse_bool(&val) {
                self.merge.require_single_codec = strict;
            }
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_ENCODES") {
            if let Ok(n) = val.parse::<u32>() {
                self.merge.max_concurrent_encodes = n;
            }
        }

        if let Ok(val) = env::var("CONCURRENT_DOWNLOADS") {
            if let Ok(n) = val.parse::<usize>() {
                self.download.concurrent_downloads = n;
            }
        }

        if let Ok(val) = env::var("MAX_DOWNLOAD_SIZE") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.download.max_download_bytes = bytes;
            }
        }

        if let Ok(val) = env::var("DOWNLOAD_TIMEOUT") {
            if let Ok(secs) = val.parse::<u64>() {
                self.download.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("GOFILE_ENDPOINT") {
            if !val.is_empty() {
                self.publish.gofile_endpoint = val;
            }
        }

        if let Ok(val) = env::var("GOFILE_API_TOKEN") {
            self.publish.gofile_token = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Reject values the pipeline cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_videos < 2 {
            return Err(ConfigError::Invalid(format!(
                "queue.max_videos must be at least 2, got {}",
                self.queue.max_videos
            )));
        }
        if self.download.concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "download.concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.merge.default_format.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "merge.default_format must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
