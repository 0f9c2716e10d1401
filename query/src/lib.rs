pub mod diagnostics;
pub mod engine;
pub mod fusion;
pub mod graphrag;
pub mod request;
pub mod rerank;

pub use engine::{EngineConfig, RetrievalEngine, RetrievalError, RetrievalOutput};
pub use request::{GraphOptions, RetrievalMode, RetrievalRequest};
