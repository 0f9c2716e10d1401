use crate::AdapterError;
use async_trait::async_trait;
use curio_core::embedding::deterministic_embedding;
use curio_core::model::sha256_hex;

/// Dense text embedding capability. Identity and version flow into every
/// chunk record and cache key, so swapping models never reuses stale
/// vectors.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    fn id(&self) -> &str;
    fn version(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed_text(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError>;
}

#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    fn id(&self) -> &str;
    fn version(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, AdapterError>;
}

/// Local hash-projected embedder. Not semantically meaningful, but
/// deterministic and dimension-correct; the default binding for single-host
/// deployments without an embedding service.
pub struct DeterministicEmbedder {
    id: String,
    version: String,
    dims: usize,
}

impl DeterministicEmbedder {
    pub fn new(id: impl Into<String>, version: impl Into<String>, dims: usize) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            dims: dims.max(1),
        }
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new("local-hash", "1", 64)
    }
}

#[async_trait]
impl TextEmbedder for DeterministicEmbedder {
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
        let model_key = format!("{}@{}", self.id, self.version);
        Ok(texts
            .iter()
            .map(|text| deterministic_embedding(text, &model_key, self.dims))
            .collect())
    }
}

#[async_trait]
impl ImageEmbedder for DeterministicEmbedder {
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
        let model_key = format!("{}@{}", self.id, self.version);
        let digest = sha256_hex(bytes);
        Ok(deterministic_embedding(&digest, &model_key, self.dims))
    }
}

/// Bag-of-tokens embedder: each token hashes to a bucket, counts are
/// L2-normalized. Near-duplicate texts land close in cosine space, which
/// makes semantic dedup meaningful without an external model.
pub struct TokenHashEmbedder {
    id: String,
    version: String,
    dims: usize,
}

impl TokenHashEmbedder {
    pub fn new(id: impl Into<String>, version: impl Into<String>, dims: usize) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            dims: dims.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = sha256_hex(token.to_lowercase().as_bytes());
            let bucket =
                usize::from_str_radix(&digest[..8], 16).unwrap_or(0) % self.dims;
            out[bucket] += 1.0;
        }

        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut out {
                *value /= norm;
            }
        }
        out
    }
}

impl Default for TokenHashEmbedder {
    fn default() -> Self {
        Self::new("token-hash", "1", 256)
    }
}

#[async_trait]
impl TextEmbedder for TokenHashEmbedder {
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
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}
