//! Local outbox destination: the artifact is copied into a directory together with a
//! JSON sidecar describing it. Used as the primary destination when no chat surface is
//! attached.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{PublishDestination, PublishError, PublishMetadata};

pub struct LocalOutboxDestination {
    dir: PathBuf,
}

impl LocalOutboxDestination {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PublishDestination for LocalOutboxDestination {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn publish(&self, artifact: &Path, metadata: &PublishMetadata) -> Result<String, PublishError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let file_name = if metadata.file_name.is_empty() {
            artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "video.mp4".to_string())
        } else {
            metadata.file_name.clone()
        };
        let target = self.dir.join(&file_name);
        tokio::fs::copy(artifact, &target).await?;

        let sidecar = serde_json::to_vec_pretty(metadata)
            .map_err(|e| PublishError::InvalidResponse(e.to_string()))?;
        tokio::fs::write(self.dir.join(format!("{}.json", file_name)), sidecar).await?;

        info!(path = %target.display(), "artifact placed in outbox");
        Ok(target.to_string_lossy().into_owned())
    }
}
