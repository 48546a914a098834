//! Remote fetch adapter
//!
//! Downloads direct video links into a user's scratch directory. Transfers are
//! bounded by a semaphore, a byte ceiling and a request timeout.

use async_trait::async_trait;
use futures_util::StreamExt;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadConfig;

/// Extensions accepted from remote links
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov", "m4v"];

/// File name used when the URL path has none
pub const DEFAULT_FILE_NAME: &str = "video.mp4";

/// Error type for downloads
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("server returned status {0}")]
    Status(u16),

    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer progress passed to the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

/// Progress callback; may borrow from the caller's frame.
pub type ProgressFn<'a> = dyn Fn(DownloadProgress) + Send + Sync + 'a;

/// Fetch a URL to a local file
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url` into `dest_dir`, returning the final path.
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<PathBuf, DownloadError>;
}

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://[^\s/$.?#][^\s]*$").expect("Invalid regex"));

/// Whether `text` looks like a direct link to a video.
pub fn is_direct_video_url(text: &str) -> bool {
    let text = text.trim();
    if !URL_PATTERN.is_match(text) || Url::parse(text).is_err() {
        return false;
    }
    let lower = text.to_lowercase();
    SUPPORTED_EXTENSIONS
        .iter()
        .map(|ext| format!(".{}", ext))
        .chain(
            [".zip", ".rar", "video", "watch", "dl", "download"]
                .into_iter()
                .map(String::from),
        )
        .any(|indicator| lower.contains(&indicator))
}

/// File name for `url`: last path segment, percent-decoded.
///
/// Segments without an extension fall back to [`DEFAULT_FILE_NAME`]; unsupported
/// extensions are rejected.
pub fn filename_from_url(url: &Url) -> Result<String, DownloadError> {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    // Decoded names must not smuggle in directories.
    let name = sanitize_file_name(decoded.rsplit(['/', '\\']).next().unwrap_or(""));

    let name = if name.is_empty() || !name.contains('.') {
        DEFAULT_FILE_NAME.to_string()
    } else {
        name
    };

    let ext = Path::new(&name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(name)
    } else {
        Err(DownloadError::UnsupportedType(name))
    }
}

/// Replace control characters (newlines included) with `_` and trim the result.
///
/// Stored names end up inside concat manifests, where a line break would start a
/// new directive.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// `path` if free, else `stem_1.ext`, `stem_2.ext`, ...
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    (1..)
        .map(|n| parent.join(format!("{}_{}{}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// [`Fetcher`] over HTTP
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(cfg: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(cfg.concurrent_downloads.max(1))),
            max_bytes: cfg.max_download_bytes,
        })
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn stream_to(
        &self,
        response: reqwest::Response,
        part_path: &Path,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<u64, DownloadError> {
        let total = response.content_length();
        let mut file = tokio::fs::File::create(part_path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            if downloaded > self.max_bytes {
                return Err(DownloadError::TooLarge {
                    size: downloaded,
                    limit: self.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
            if let Some(report) = progress {
                report(DownloadProgress { downloaded, total });
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(downloaded)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<PathBuf, DownloadError> {
        let parsed = Url::parse(url.trim()).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!("unsupported scheme {}", parsed.scheme())));
        }
        let file_name = filename_from_url(&parsed)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DownloadError::InvalidUrl("downloader shut down".to_string()))?;

        let response = self.client.get(parsed.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }
        if let Some(size) = response.content_length() {
            if size > self.max_bytes {
                return Err(DownloadError::TooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let target = unique_path(&dest_dir.join(&file_name));
        let part_path = target.with_extension(format!(
            "{}.part",
            target.extension().and_then(|e| e.to_str()).unwrap_or("bin")
        ));

        debug!(url = %parsed, path = %part_path.display(), "download started");
        match self.stream_to(response, &part_path, progress).await {
            Ok(bytes) => {
                tokio::fs::rename(&part_path, &target).await?;
                info!(url = %parsed, path = %target.display(), bytes, "download complete");
                Ok(target)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part_path).await {
                    warn!(path = %part_path.display(), error = %rm, "failed to remove partial download");
                }
                Err(e)
            }
        }
    }
}
