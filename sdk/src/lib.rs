pub mod envelope;
pub mod lifecycle;
pub mod service;
pub mod system;

pub use envelope::{ApiError, OpResponse, RetrieveResponse};
pub use service::{CurioService, RequestContext, ServiceHandle};
