use serde::{Deserialize, Serialize};

/// Typed error codes for validation-tier faults. Only these surface as
/// request errors; everything else degrades into issue codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Conflict,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

pub trait CurioError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}

/// Degradation markers attached to responses. A response carrying issues is
/// still a success; `partial` is set when a stage was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    NoHits,
    LatencyBudgetExceeded,
    EmbeddingDown,
    RerankTimeout,
    RerankDown,
    RerankSkippedBudget,
    Bm25Timeout,
    VectorTimeout,
    GraphDown,
    GraphTimeout,
    GraphQueryInvalid,
    Nl2queryFailed,
    ModalityBlocked,
    ContainerUnavailable,
    ContainerNotFound,
    PolicyInvalid,
    Overloaded,
    LeaseLost,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::NoHits => "NO_HITS",
            IssueCode::LatencyBudgetExceeded => "LATENCY_BUDGET_EXCEEDED",
            IssueCode::EmbeddingDown => "EMBEDDING_DOWN",
            IssueCode::RerankTimeout => "RERANK_TIMEOUT",
            IssueCode::RerankDown => "RERANK_DOWN",
            IssueCode::RerankSkippedBudget => "RERANK_SKIPPED_BUDGET",
            IssueCode::Bm25Timeout => "BM25_TIMEOUT",
            IssueCode::VectorTimeout => "VECTOR_TIMEOUT",
            IssueCode::GraphDown => "GRAPH_DOWN",
            IssueCode::GraphTimeout => "GRAPH_TIMEOUT",
            IssueCode::GraphQueryInvalid => "GRAPH_QUERY_INVALID",
            IssueCode::Nl2queryFailed => "NL2QUERY_FAILED",
            IssueCode::ModalityBlocked => "MODALITY_BLOCKED",
            IssueCode::ContainerUnavailable => "CONTAINER_UNAVAILABLE",
            IssueCode::ContainerNotFound => "CONTAINER_NOT_FOUND",
            IssueCode::PolicyInvalid => "POLICY_INVALID",
            IssueCode::Overloaded => "OVERLOADED",
            IssueCode::LeaseLost => "LEASE_LOST",
        }
    }
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
