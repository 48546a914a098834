//! Dual publishing of a merged artifact
//!
//! A [`PublishOrchestrator`] hands the artifact to a primary and a secondary
//! [`PublishDestination`] at the same time and waits for both. One branch failing,
//! timing out or panicking never hides the other branch's result.

pub mod gofile;
pub mod outbox;

pub use gofile::GofileUploader;
pub use outbox::LocalOutboxDestination;

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::probe::Resolution;

/// Error type for a single destination
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("artifact unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// What a destination needs to present the artifact
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishMetadata {
    pub file_name: String,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub resolution: Option<Resolution>,
    pub thumbnail: Option<PathBuf>,
    pub caption: String,
}

/// One place a merged artifact can be published to
#[async_trait]
pub trait PublishDestination: Send + Sync {
    /// Short name used in results and reports
    fn name(&self) -> &str;

    /// Publish `artifact`, returning a locator (link, message id, path).
    async fn publish(&self, artifact: &Path, metadata: &PublishMetadata) -> Result<String, PublishError>;
}

/// Outcome of one destination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishResult {
    pub destination: String,
    pub success: bool,
    pub locator: Option<String>,
    pub error: Option<String>,
}

impl PublishResult {
    pub fn ok(destination: &str, locator: String) -> Self {
        Self {
            destination: destination.to_string(),
            success: true,
            locator: Some(locator),
            error: None,
        }
    }

    pub fn failed(destination: &str, error: impl Into<String>) -> Self {
        Self {
            destination: destination.to_string(),
            success: false,
            locator: None,
            error: Some(error.into()),
        }
    }
}

/// Aggregate publish status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// Both destinations succeeded
    Complete,
    /// Exactly one destination succeeded
    Partial,
    /// Neither destination succeeded
    Failed,
}

/// Reconciled result of both destinations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedPublishResult {
    pub primary: PublishResult,
    pub secondary: PublishResult,
    pub status: PublishStatus,
}

impl CombinedPublishResult {
    pub fn new(primary: PublishResult, secondary: PublishResult) -> Self {
        let status = match (primary.success, secondary.success) {
            (true, true) => PublishStatus::Complete,
            (false, false) => PublishStatus::Failed,
            _ => PublishStatus::Partial,
        };
        Self {
            primary,
            secondary,
            status,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PublishStatus::Failed
    }
}

/// Runs both destinations concurrently and joins them
pub struct PublishOrchestrator {
    primary: Arc<dyn PublishDestination>,
    secondary: Arc<dyn PublishDestination>,
    timeout: Duration,
}

impl PublishOrchestrator {
    pub fn new(
        primary: Arc<dyn PublishDestination>,
        secondary: Arc<dyn PublishDestination>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            timeout,
        }
    }

    /// Publish to both destinations; always returns a combined result.
    pub async fn publish(&self, artifact: &Path, metadata: &PublishMetadata) -> CombinedPublishResult {
        let primary_name = self.primary.name().to_string();
        let secondary_name = self.secondary.name().to_string();

        let primary = self.spawn_branch(self.primary.clone(), artifact, metadata);
        let secondary = self.spawn_branch(self.secondary.clone(), artifact, metadata);
        let (primary, secondary) = tokio::join!(primary, secondary);

        let primary = primary.unwrap_or_else(|e| {
            PublishResult::failed(&primary_name, format!("destination task aborted: {}", e))
        });
        let secondary = secondary.unwrap_or_else(|e| {
            PublishResult::failed(&secondary_name, format!("destination task aborted: {}", e))
        });

        let combined = CombinedPublishResult::new(primary, secondary);
        match combined.status {
            PublishStatus::Complete => info!(artifact = %artifact.display(), "published to both destinations"),
            status => warn!(
                artifact = %artifact.display(),
                ?status,
                primary_error = ?combined.primary.error,
                secondary_error = ?combined.secondary.error,
                "publish incomplete"
            ),
        }
        combined
    }

    fn spawn_branch(
        &self,
        destination: Arc<dyn PublishDestination>,
        artifact: &Path,
        metadata: &PublishMetadata,
    ) -> tokio::task::JoinHandle<PublishResult> {
        let artifact = artifact.to_path_buf();
        let metadata = metadata.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let name = destination.name().to_string();
            match tokio::time::timeout(timeout, destination.publish(&artifact, &metadata)).await {
                Ok(Ok(locator)) => PublishResult::ok(&name, locator),
                Ok(Err(e)) => PublishResult::failed(&name, e.to_string()),
                Err(_) => PublishResult::failed(&name, format!("timed out after {}s", timeout.as_secs())),
            }
        })
    }
}
