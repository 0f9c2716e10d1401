use crate::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankCandidate {
    pub id: String,
    pub text: String,
}

/// Second-pass scoring of top candidates. Returns one score per candidate in
/// input order; the caller reorders.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<f32>, AdapterError>;
}

/// Token-overlap reranker for local deployments: Jaccard similarity between
/// the query and candidate token sets. Deterministic, which also pins the
/// rerank cache tests.
pub struct LexicalReranker {
    provider: String,
    model: String,
}

impl LexicalReranker {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl Default for LexicalReranker {
    fn default() -> Self {
        Self::new("lexical", "jaccard-1")
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
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
        let query_tokens = token_set(query);
        Ok(candidates
            .iter()
            .map(|candidate| jaccard(&query_tokens, &token_set(&candidate.text)))
            .collect())
    }
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}
