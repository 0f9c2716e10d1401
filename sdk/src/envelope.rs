use curio_core::error::{ErrorCode, IssueCode};
use query::engine::RetrievalOutput;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "1";

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Typed error body. Only policy/auth/validation faults surface this way;
/// degradations ride inside successful envelopes as issue codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<IssueCode>,
    pub request_id: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            code,
            message: message.into(),
            issues: Vec::new(),
            request_id: request_id.to_string(),
        }
    }

    pub fn with_issue(mut self, issue: IssueCode) -> Self {
        self.issues.push(issue);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub version: String,
    pub request_id: String,
    #[serde(flatten)]
    pub output: RetrievalOutput,
}

/// Envelope for lifecycle and mutation operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResponse {
    pub version: String,
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub timings_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<IssueCode>,
}

impl OpResponse {
    pub fn success(request_id: &str, timings_ms: u64) -> Self {
        Self {
            version: API_VERSION.to_string(),
            request_id: request_id.to_string(),
            success: true,
            job_id: None,
            timings_ms,
            issues: Vec::new(),
        }
    }

    pub fn job(request_id: &str, job_id: String, timings_ms: u64) -> Self {
        Self {
            version: API_VERSION.to_string(),
            request_id: request_id.to_string(),
            success: true,
            job_id: Some(job_id),
            timings_ms,
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: IssueCode) -> Self {
        self.issues.push(issue);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_response_serializes_envelope_fields() {
        let response = OpResponse::job("req-1", "job_abc".to_string(), 12);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"request_id\":\"req-1\""));
        assert!(json.contains("\"job_id\":\"job_abc\""));
        assert!(!json.contains("issues"));
    }

    #[test]
    fn api_error_carries_typed_code() {
        let error = ApiError::new(ErrorCode::NotFound, "container missing", "req-2")
            .with_issue(IssueCode::ContainerNotFound);
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("CONTAINER_NOT_FOUND"));
    }
}
