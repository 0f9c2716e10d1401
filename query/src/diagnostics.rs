use curio_core::error::IssueCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub bm25_ms: u64,
    pub vector_ms: u64,
    pub graph_ms: u64,
    pub rerank_ms: u64,
    pub fuse_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankDiagnostics {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    pub node_count: usize,
    pub edge_count: usize,
    pub execution_ms: u64,
}

/// Per-request diagnostics aggregator. Every pipeline step records into this
/// and the response carries it verbatim when the caller asked for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub budget_ms: u64,
    pub hit_counts: BTreeMap<String, usize>,
    pub rerank: RerankDiagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphDiagnostics>,
    /// Near-duplicate chunks elided by result dedup.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub elided_chunk_ids: Vec<String>,
}

/// Ordered, deduplicated issue collection. BTreeSet keeps emission stable
/// across runs so clients can assert on it.
#[derive(Debug, Clone, Default)]
pub struct IssueSet {
    issues: BTreeSet<IssueCode>,
}

impl IssueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: IssueCode) {
        self.issues.insert(issue);
    }

    pub fn contains(&self, issue: IssueCode) -> bool {
        self.issues.contains(&issue)
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn into_vec(self) -> Vec<IssueCode> {
        self.issues.into_iter().collect()
    }
}
