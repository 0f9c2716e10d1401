use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::blob::BlobStore;
use thiserror::Error;

use curio_core::model::{sha256_hex, Modality};

/// One source entry of an ingest job payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestSource {
    /// http(s) URL or `upload://<token>` into the blob store's upload area.
    #[serde(default)]
    pub uri: Option<String>,
    /// Upload-area token, equivalent to `upload://<token>`.
    #[serde(default)]
    pub file_token: Option<String>,
    /// Inline content, for local callers and tests.
    #[serde(default)]
    pub inline_text: Option<String>,
    #[serde(default)]
    pub modality: Option<Modality>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// 4xx-class failures: retrying cannot help.
    #[error("fetch failed permanently: {0}")]
    Permanent(String),
    /// Network trouble and 5xx-class failures.
    #[error("fetch failed transiently: {0}")]
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub bytes: Vec<u8>,
    pub uri: String,
    pub mime: Option<String>,
    pub fetcher: String,
}

pub struct Fetcher {
    client: reqwest::Client,
    blobs: Arc<BlobStore>,
}

impl Fetcher {
    pub fn new(blobs: Arc<BlobStore>, http_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_default();
        Self { client, blobs }
    }

    pub async fn fetch(&self, source: &IngestSource) -> Result<FetchedSource, FetchError> {
        if let Some(text) = &source.inline_text {
            let bytes = text.as_bytes().to_vec();
            let uri = source
                .uri
                .clone()
                .unwrap_or_else(|| format!("inline://{}", &sha256_hex(&bytes)[..12]));
            return Ok(FetchedSource {
                bytes,
                uri,
                mime: source.mime.clone(),
                fetcher: "inline".to_string(),
            });
        }

        if let Some(token) = &source.file_token {
            return self.fetch_upload(token, source).await;
        }

        let Some(uri) = &source.uri else {
            return Err(FetchError::Permanent(
                "source carries neither uri, file_token nor inline content".to_string(),
            ));
        };

        if let Some(token) = uri.strip_prefix("upload://") {
            return self.fetch_upload(token, source).await;
        }

        if uri.starts_with("http://") || uri.starts_with("https://") {
            return self.fetch_http(uri, source).await;
        }

        Err(FetchError::Permanent(format!("unsupported uri: {}", uri)))
    }

    async fn fetch_upload(
        &self,
        token: &str,
        source: &IngestSource,
    ) -> Result<FetchedSource, FetchError> {
        let bytes = self
            .blobs
            .get_upload(token)
            .await
            .map_err(|err| FetchError::Permanent(err.to_string()))?;
        Ok(FetchedSource {
            bytes,
            uri: format!("upload://{}", token),
            mime: source.mime.clone(),
            fetcher: "upload".to_string(),
        })
    }

    async fn fetch_http(
        &self,
        uri: &str,
        source: &IngestSource,
    ) -> Result<FetchedSource, FetchError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("status {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("status {}", status)));
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .or_else(|| source.mime.clone());

        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transient(err.to_string()))?
            .to_vec();

        Ok(FetchedSource {
            bytes,
            uri: uri.to_string(),
            mime,
            fetcher: "http".to_string(),
        })
    }
}
