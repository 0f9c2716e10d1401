use crate::embedder::{ImageEmbedder, TextEmbedder};
use crate::rerank::{RerankCandidate, Reranker};
use crate::translate::{GraphQuery, GraphSchemaHint, NlTranslator};
use crate::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote JSON bindings. Each adapter gets its own client with a hard
/// timeout; retries and breaker live in the `guard` wrapper, not here.
fn build_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AdapterError::Request(err.to_string()))
}

fn map_error(err: reqwest::Error, timeout: Duration) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout(timeout)
    } else {
        AdapterError::Request(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(AdapterError::RateLimited);
    }
    if !status.is_success() {
        return Err(AdapterError::Request(format!("status {}", status)));
    }
    Ok(response)
}

pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    id: String,
    version: String,
    dims: usize,
    timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        id: impl Into<String>,
        version: impl Into<String>,
        dims: usize,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            id: id.into(),
            version: version.into(),
            dims,
            timeout,
        })
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

#[async_trait]
impl TextEmbedder for HttpEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_text(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError> {
        let model = format!("{}@{}", self.id, self.version);
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest {
                model: &model,
                texts,
            })
            .send()
            .await
            .map_err(|err| map_error(err, self.timeout))?;

        let body: EmbedResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| AdapterError::InvalidResponse(err.to_string()))?;

        if body.vectors.len() != texts.len() {
            return Err(AdapterError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                body.vectors.len()
            )));
        }
        if let Some(bad) = body.vectors.iter().find(|v| v.len() != self.dims) {
            return Err(AdapterError::InvalidResponse(format!(
                "expected {} dims, got {}",
                self.dims,
                bad.len()
            )));
        }
        Ok(body.vectors)
    }
}

#[derive(Serialize)]
struct EmbedImageRequest<'a> {
    model: &'a str,
    /// Hex-encoded bytes; vectors and blobs never ride the public wire, but
    /// adapter RPCs are internal.
    image_hex: String,
}

#[derive(Deserialize)]
struct EmbedImageResponse {
    vector: Vec<f32>,
}

#[async_trait]
impl ImageEmbedder for HttpEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, AdapterError> {
        let model = format!("{}@{}", self.id, self.version);
        let image_hex = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let response = self
            .client
            .post(format!("{}/embed_image", self.base_url))
            .json(&EmbedImageRequest {
                model: &model,
                image_hex,
            })
            .send()
            .await
            .map_err(|err| map_error(err, self.timeout))?;

        let body: EmbedImageResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| AdapterError::InvalidResponse(err.to_string()))?;

        if body.vector.len() != self.dims {
            return Err(AdapterError::InvalidResponse(format!(
                "expected {} dims, got {}",
                self.dims,
                body.vector.len()
            )));
        }
        Ok(body.vector)
    }
}

pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    provider: String,
    model: String,
    timeout: Duration,
}

impl HttpReranker {
    pub fn new(
        base_url: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            provider: provider.into(),
            model: model.into(),
            timeout,
        })
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    candidates: &'a [RerankCandidate],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

#[async_trait]
impl Reranker for HttpReranker {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<f32>, AdapterError> {
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&RerankRequest {
                model: &self.model,
                query,
                candidates,
            })
            .send()
            .await
            .map_err(|err| map_error(err, self.timeout))?;

        let body: RerankResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| AdapterError::InvalidResponse(err.to_string()))?;

        if body.scores.len() != candidates.len() {
            return Err(AdapterError::InvalidResponse(format!(
                "expected {} scores, got {}",
                candidates.len(),
                body.scores.len()
            )));
        }
        Ok(body.scores)
    }
}

pub struct HttpTranslator {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTranslator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            timeout,
        })
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    query: &'a str,
    schema: &'a GraphSchemaHint,
}

#[async_trait]
impl NlTranslator for HttpTranslator {
    async fn translate(
        &self,
        query: &str,
        schema: &GraphSchemaHint,
    ) -> Result<GraphQuery, AdapterError> {
        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&TranslateRequest { query, schema })
            .send()
            .await
            .map_err(|err| map_error(err, self.timeout))?;

        check_status(response)
            .await?
            .json::<GraphQuery>()
            .await
            .map_err(|err| AdapterError::InvalidResponse(err.to_string()))
    }
}
