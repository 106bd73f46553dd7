pub mod jobs;
pub mod pipeline;
pub mod source;

pub use jobs::{JobManager, JobRecord, JobStatus};
pub use pipeline::{IndexReport, IndexingPipeline, PipelineConfig};
pub use source::{DirStore, DocumentStore, PlainTextExtractor, TextExtractor};
