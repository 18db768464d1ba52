#![deny(missing_docs)]

//! Core library for the Rusty RAG question answering service.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding capability and adapters.
pub mod embedding;
/// Error taxonomy shared by every component.
pub mod error;
/// Answer generation capability and adapters.
pub mod generation;
/// In-process vector index with snapshot persistence.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Document, chunk and query-log store.
pub mod metadata;
/// Pipeline counters.
pub mod metrics;
/// Chunking, deduplication and the ingestion/query orchestrator.
pub mod pipeline;
/// Optional second-stage reranking.
pub mod rerank;
/// Binary snapshot codec and atomic file writes.
pub mod storage;
