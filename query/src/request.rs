use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_K: usize = 50;
const DEFAULT_K: usize = 10;
pub const MAX_HOPS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Semantic,
    Bm25,
    #[default]
    Hybrid,
    Crossmodal,
    Graph,
    HybridGraph,
}

impl RetrievalMode {
    pub fn wants_dense(&self) -> bool {
        matches!(
            self,
            RetrievalMode::Semantic
                | RetrievalMode::Hybrid
                | RetrievalMode::Crossmodal
                | RetrievalMode::HybridGraph
        )
    }

    pub fn wants_graph(&self) -> bool {
        matches!(self, RetrievalMode::Graph | RetrievalMode::HybridGraph)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphOptions {
    #[serde(default)]
    pub max_hops: Option<u8>,
    #[serde(default = "default_neighbor_k")]
    pub neighbor_k: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            max_hops: None,
            neighbor_k: default_neighbor_k(),
        }
    }
}

fn default_neighbor_k() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    #[serde(default)]
    pub query: Option<String>,
    /// Raw image bytes for crossmodal queries; never echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_image: Option<Vec<u8>>,
    pub container_ids: Vec<String>,
    #[serde(default)]
    pub mode: RetrievalMode,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub rerank: Option<bool>,
    #[serde(default)]
    pub diagnostics: bool,
    #[serde(default)]
    pub graph: Option<GraphOptions>,
    #[serde(default)]
    pub budget_ms: Option<u64>,
}

const fn default_k() -> usize {
    DEFAULT_K
}

impl Default for RetrievalRequest {
    fn default() -> Self {
        Self {
            query: None,
            query_image: None,
            container_ids: Vec::new(),
            mode: RetrievalMode::default(),
            k: DEFAULT_K,
            rerank: None,
            diagnostics: false,
            graph: None,
            budget_ms: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestValidationError {
    #[error("container_ids must not be empty")]
    NoContainers,
    #[error("k must be between 1 and {0}")]
    InvalidK(usize),
    #[error("query must not be empty for mode {0:?}")]
    MissingQuery(RetrievalMode),
    #[error("query_image is only valid for crossmodal mode")]
    UnexpectedImage,
    #[error("graph.max_hops must be between 1 and {0}")]
    InvalidMaxHops(u8),
    #[error("budget_ms must be positive")]
    InvalidBudget,
}

impl RetrievalRequest {
    pub fn parse_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), RequestValidationError> {
        if self.container_ids.is_empty() {
            return Err(RequestValidationError::NoContainers);
        }
        if self.k == 0 || self.k > MAX_K {
            return Err(RequestValidationError::InvalidK(MAX_K));
        }

        let has_query = self
            .query
            .as_deref()
            .map(|q| !q.trim().is_empty())
            .unwrap_or(false);
        if !has_query && !(self.mode == RetrievalMode::Crossmodal && self.query_image.is_some()) {
            return Err(RequestValidationError::MissingQuery(self.mode));
        }
        if self.query_image.is_some() && self.mode != RetrievalMode::Crossmodal {
            return Err(RequestValidationError::UnexpectedImage);
        }

        if let Some(graph) = &self.graph {
            if let Some(hops) = graph.max_hops {
                if hops == 0 || hops > MAX_HOPS {
                    return Err(RequestValidationError::InvalidMaxHops(MAX_HOPS));
                }
            }
        }
        if self.budget_ms == Some(0) {
            return Err(RequestValidationError::InvalidBudget);
        }

        Ok(())
    }
}
