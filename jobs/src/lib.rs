pub mod queue;
pub mod worker;

pub use queue::{JobQueue, QueueConfig, QueueError};
pub use worker::{JobFailure, JobHandler, WorkerPool, WorkerPoolHandle};
