pub mod embedder;
pub mod extract;
pub mod guard;
pub mod http;
pub mod registry;
pub mod rerank;
pub mod service;
pub mod translate;

use std::time::Duration;
use thiserror::Error;

/// Failures shared by every external ML adapter. `Down` is the typed
/// short-circuit produced by an open circuit breaker; callers degrade on it
/// rather than erroring the request.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} is down")]
    Down(String),
    #[error("adapter call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
