//! Error taxonomy surfaced by the RAG pipeline.
//!
//! Component errors (chunking, index, embedding, generation, reranking, metadata) each have their
//! own `thiserror` enum close to the code that raises them. They all funnel into [`RagError`],
//! whose variants are the kinds callers branch on: the HTTP layer maps them to status codes and
//! batch ingestion reports them per document.

use crate::embedding::EmbeddingError;
use crate::generation::GenerationError;
use crate::index::IndexError;
use crate::metadata::MetadataError;
use crate::pipeline::{ChunkingError, QueryStage};
use crate::rerank::RerankError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`crate::pipeline::RagPipeline`] operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// Configuration or chunking parameters violate an invariant.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Unknown document or chunk identifier.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Embedder, generator or reranker could not be reached or failed.
    #[error("Upstream unavailable during {stage}: {message}")]
    UpstreamUnavailable {
        /// Pipeline stage that issued the call.
        stage: QueryStage,
        /// Diagnostic reported by the upstream adapter.
        message: String,
    },
    /// Embedder, generator or reranker did not answer within the configured bound.
    #[error("Upstream timed out during {stage} after {timeout:?}")]
    UpstreamTimeout {
        /// Pipeline stage that issued the call.
        stage: QueryStage,
        /// Timeout applied to each attempt.
        timeout: Duration,
    },
    /// Persisted snapshot is inconsistent and must be rebuilt from source documents.
    #[error("Index corruption: {0}")]
    IndexCorruption(String),
    /// Request is malformed (for example an empty query).
    #[error("Validation error: {0}")]
    Validation(String),
    /// Caller abandoned the request before it completed.
    #[error("Request cancelled")]
    Cancelled,
    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RagError {
    /// Short machine-readable label used in logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::NotFound(_) => "not_found",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::IndexCorruption(_) => "index_corruption",
            Self::Validation(_) => "validation_error",
            Self::Cancelled => "cancelled",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<ChunkingError> for RagError {
    fn from(error: ChunkingError) -> Self {
        Self::InvalidConfig(error.to_string())
    }
}

impl From<IndexError> for RagError {
    fn from(error: IndexError) -> Self {
        match error {
            IndexError::DimensionMismatch { .. } | IndexError::InvalidVector(_) => {
                Self::InvalidConfig(error.to_string())
            }
            IndexError::Corruption(message) => Self::IndexCorruption(message),
            IndexError::Encoding(message) => Self::Storage(message),
            IndexError::Io(source) => Self::Storage(source.to_string()),
        }
    }
}

impl From<MetadataError> for RagError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::NotFound(id) => Self::NotFound(id),
            MetadataError::Corruption(message) => Self::IndexCorruption(message),
            MetadataError::Io(source) => Self::Storage(source.to_string()),
            MetadataError::Serialization(source) => Self::Storage(source.to_string()),
            MetadataError::Encoding(message) => Self::Storage(message),
        }
    }
}

impl From<EmbeddingError> for RagError {
    fn from(error: EmbeddingError) -> Self {
        match error {
            EmbeddingError::InvalidInput(message) => Self::Validation(message),
            other => Self::UpstreamUnavailable {
                stage: QueryStage::Embedding,
                message: other.to_string(),
            },
        }
    }
}

impl From<GenerationError> for RagError {
    fn from(error: GenerationError) -> Self {
        match error {
            GenerationError::InvalidInput(message) => Self::Validation(message),
            other => Self::UpstreamUnavailable {
                stage: QueryStage::Generating,
                message: other.to_string(),
            },
        }
    }
}

impl From<RerankError> for RagError {
    fn from(error: RerankError) -> Self {
        Self::UpstreamUnavailable {
            stage: QueryStage::Reranking,
            message: error.to_string(),
        }
    }
}
