//! GoFile hosting upload

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{PublishDestination, PublishError, PublishMetadata};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    #[serde(default)]
    data: Option<UploadData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadData {
    download_page: Option<String>,
    code: Option<String>,
}

/// Interpret a GoFile JSON payload, returning the download page.
pub fn parse_upload_response(body: &str) -> Result<String, PublishError> {
    let response: UploadResponse =
        serde_json::from_str(body).map_err(|e| PublishError::InvalidResponse(e.to_string()))?;

    if response.status != "ok" {
        return Err(PublishError::Rejected(
            response.message.unwrap_or(response.status),
        ));
    }

    let data = response
        .data
        .ok_or_else(|| PublishError::InvalidResponse("missing data".to_string()))?;
    if let Some(code) = &data.code {
        debug!(code, "gofile file code");
    }
    data.download_page
        .ok_or_else(|| PublishError::InvalidResponse("missing downloadPage".to_string()))
}

/// Uploads to a GoFile-compatible endpoint with a streamed multipart body
pub struct GofileUploader {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl GofileUploader {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl PublishDestination for GofileUploader {
    fn name(&self) -> &str {
        "gofile"
    }

    async fn publish(&self, artifact: &Path, metadata: &PublishMetadata) -> Result<String, PublishError> {
        let file = tokio::fs::File::open(artifact).await?;
        let size = file.metadata().await?.len();
        let file_name = if metadata.file_name.is_empty() {
            artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "video.mp4".to_string())
        } else {
            metadata.file_name.clone()
        };

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, size).file_name(file_name.clone());
        let mut form = Form::new().part("file", part);
        if let Some(token) = &self.token {
            form = form.text("token", token.clone());
        }

        info!(file = %file_name, size, endpoint = %self.endpoint, "uploading to gofile");
        let response = self.client.post(&self.endpoint).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        let link = parse_upload_response(&body)?;
        info!(file = %file_name, link = %link, "gofile upload complete");
        Ok(link)
    }
}
