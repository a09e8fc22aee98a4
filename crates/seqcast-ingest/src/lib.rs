// ABOUTME: Ingestion crate for seqcast: event sources, the dedup/commit/publish pipeline, and the async worker.
// ABOUTME: The pipeline is the log's single writer; the worker keeps its store calls off the async runtime.

pub mod jsonl;
pub mod pipeline;
pub mod source;
pub mod worker;

pub use jsonl::{JsonlSource, JsonlSourceWriter};
pub use pipeline::{IngestError, IngestOutcome, IngestPipeline};
pub use source::{ChannelSource, EventSource, SourceError};
pub use worker::{IngestSummary, spawn_ingestion};
