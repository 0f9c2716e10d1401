pub mod chunker;
pub mod dedupe;
pub mod fetch;
pub mod graph_build;
pub mod normalize;
pub mod processor;

pub use processor::{IngestOutcome, IngestProcessor, IngestSource};
