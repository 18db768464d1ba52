//! Ingestion and query orchestration.
//!
//! Ingestion: content digest check, chunking, per-chunk embedding, then the index and the
//! document store are written as one unit. Queries walk the [`QueryStage`] machine: embed,
//! retrieve, optionally rerank, build a grounded prompt, generate.

pub mod chunking;
mod dedup;
mod prompt;
mod retry;
pub mod sanitize;
mod service;
pub mod state;
pub mod types;

pub use chunking::{Chunk, Chunker, ChunkingError};
pub use dedup::{Deduplicator, DigestGuard, content_digest};
pub use service::{INDEX_FILE, PREVIOUS_INDEX_FILE, RagApi, RagContext, RagPipeline};
pub use state::{IllegalTransition, QueryRun, QueryStage};
pub use types::{
    BatchFailure, BatchOutcome, ClearOutcome, DirectoryOptions, DocumentUpdate, Health,
    IngestOutcome, IngestStatus, NO_CONTEXT_ANSWER, NewDocument, QueryRequest, QueryResponse,
    Source, Stats,
};
