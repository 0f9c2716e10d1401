use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ContainerState, Modality};

pub const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.92;
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 320;
pub const DEFAULT_CHUNK_MAX_CHARS: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP_CHARS: usize = 120;
pub const DEFAULT_THUMBNAIL_MAX_EDGE: u32 = 2048;
pub const MAX_RERANK_TOP_K_IN: usize = 50;
pub const MAX_GRAPH_HOPS: u8 = 8;

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct EmbedderRef {
    pub id: String,
    pub version: String,
    pub dims: u32,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct RerankPolicy {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub top_k_in: u32,
    pub top_k_out: u32,
    pub timeout_ms: u64,
    pub cache_ttl_s: u64,
}

impl Default for RerankPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: String::new(),
            model: String::new(),
            top_k_in: 32,
            top_k_out: 10,
            timeout_ms: 400,
            cache_ttl_s: 600,
        }
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct GraphPolicy {
    pub enabled: bool,
    pub max_hops: u8,
    pub query_timeout_ms: u64,
    /// Whitelisted node labels and edge types; the NL2Query validator rejects
    /// anything outside this schema.
    pub node_labels: Vec<String>,
    pub edge_types: Vec<String>,
}

impl Default for GraphPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_hops: 2,
            query_timeout_ms: 500,
            node_labels: Vec::new(),
            edge_types: Vec::new(),
        }
    }
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Default,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Restricted,
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Default,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationPolicy {
    Private,
    #[default]
    SharedRead,
    SharedWrite,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct ChunkingPolicy {
    pub max_chars: u32,
    pub overlap_chars: u32,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_CHUNK_MAX_CHARS as u32,
            overlap_chars: DEFAULT_CHUNK_OVERLAP_CHARS as u32,
        }
    }
}

/// The container's declarative contract. Both pipelines consume the resolved
/// form (`Policy`), never the manifest directly.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct ContainerManifest {
    pub slug: String,
    pub theme: String,
    #[serde(default)]
    pub description: String,
    pub modalities: Vec<Modality>,
    pub embedder: EmbedderRef,
    pub latency_budget_ms: u64,
    #[serde(default)]
    pub rerank: RerankPolicy,
    #[serde(default)]
    pub freshness_lambda: f32,
    #[serde(default)]
    pub graph: GraphPolicy,
    #[serde(default)]
    pub visibility: Visibility,
    /// Agent subjects allowed to read; empty means unrestricted.
    #[serde(default)]
    pub acl: Vec<String>,
    #[serde(default)]
    pub collaboration: CollaborationPolicy,
    #[serde(default = "default_semantic_threshold")]
    pub semantic_dedup_threshold: f32,
    #[serde(default = "default_snippet_max_chars")]
    pub snippet_max_chars: u32,
    #[serde(default)]
    pub chunking: ChunkingPolicy,
    #[serde(default = "default_thumbnail_max_edge")]
    pub thumbnail_max_edge: u32,
}

fn default_semantic_threshold() -> f32 {
    DEFAULT_SEMANTIC_THRESHOLD
}

fn default_snippet_max_chars() -> u32 {
    DEFAULT_SNIPPET_MAX_CHARS as u32
}

fn default_thumbnail_max_edge() -> u32 {
    DEFAULT_THUMBNAIL_MAX_EDGE
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("invalid manifest: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl ContainerManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut violations = Vec::new();

        if self.slug.trim().is_empty() {
            violations.push("slug must not be empty".to_string());
        }
        if !self
            .slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            violations.push("slug must be lowercase ascii, digits, '-' or '_'".to_string());
        }
        if self.modalities.is_empty() {
            violations.push("modalities must not be empty".to_string());
        }
        if self.embedder.id.trim().is_empty() {
            violations.push("embedder.id must not be empty".to_string());
        }
        if self.embedder.dims == 0 || self.embedder.dims > 4096 {
            violations.push("embedder.dims must be between 1 and 4096".to_string());
        }
        if self.latency_budget_ms < 10 || self.latency_budget_ms > 60_000 {
            violations.push("latency_budget_ms must be between 10 and 60000".to_string());
        }
        if self.freshness_lambda < 0.0 {
            violations.push("freshness_lambda must be non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.semantic_dedup_threshold) {
            violations.push("semantic_dedup_threshold must be within [0, 1]".to_string());
        }
        if self.rerank.enabled {
            if self.rerank.provider.trim().is_empty() {
                violations.push("rerank.provider must be set when rerank is enabled".to_string());
            }
            if self.rerank.top_k_in == 0 || self.rerank.top_k_in as usize > MAX_RERANK_TOP_K_IN {
                violations.push(format!(
                    "rerank.top_k_in must be between 1 and {}",
                    MAX_RERANK_TOP_K_IN
                ));
            }
        }
        if self.graph.enabled && (self.graph.max_hops == 0 || self.graph.max_hops > MAX_GRAPH_HOPS)
        {
            violations.push(format!(
                "graph.max_hops must be between 1 and {}",
                MAX_GRAPH_HOPS
            ));
        }
        if self.chunking.max_chars == 0 {
            violations.push("chunking.max_chars must be positive".to_string());
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            violations.push("chunking.overlap_chars must be smaller than max_chars".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Invalid(violations))
        }
    }

    pub fn allows_modality(&self, modality: Modality) -> bool {
        self.modalities.contains(&modality)
    }

    /// ACL gate for read access. Restricted containers require the subject to
    /// be listed; public containers with an empty list admit everyone.
    pub fn allows_subject(&self, subject: &str) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Restricted => self.acl.iter().any(|entry| entry == subject),
        }
    }
}

/// Per-request policy produced by resolving a manifest against the request
/// budget and the global ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub container_id: String,
    pub slug: String,
    pub state: ContainerState,
    pub modalities: Vec<Modality>,
    pub embedder: EmbedderRef,
    pub budget_ms: u64,
    pub semantic_threshold: f32,
    pub rerank: Option<RerankPolicy>,
    pub freshness_lambda: f32,
    pub graph: Option<GraphPolicy>,
    pub snippet_max_chars: usize,
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub thumbnail_max_edge: u32,
    pub visibility: Visibility,
    pub acl: Vec<String>,
}

impl ContainerManifest {
    pub fn resolve(
        &self,
        container_id: &str,
        state: ContainerState,
        request_budget_ms: Option<u64>,
        global_budget_ms: u64,
    ) -> Policy {
        let mut budget = self.latency_budget_ms.min(global_budget_ms);
        if let Some(requested) = request_budget_ms {
            budget = budget.min(requested);
        }

        Policy {
            container_id: container_id.to_string(),
            slug: self.slug.clone(),
            state,
            modalities: self.modalities.clone(),
            embedder: self.embedder.clone(),
            budget_ms: budget,
            semantic_threshold: self.semantic_dedup_threshold,
            rerank: self.rerank.enabled.then(|| {
                let mut rerank = self.rerank.clone();
                rerank.top_k_in = rerank.top_k_in.min(MAX_RERANK_TOP_K_IN as u32);
                rerank
            }),
            freshness_lambda: self.freshness_lambda,
            graph: self.graph.enabled.then(|| self.graph.clone()),
            snippet_max_chars: self.snippet_max_chars as usize,
            chunk_max_chars: self.chunking.max_chars as usize,
            chunk_overlap_chars: self.chunking.overlap_chars as usize,
            thumbnail_max_edge: self.thumbnail_max_edge,
            visibility: self.visibility,
            acl: self.acl.clone(),
        }
    }
}
