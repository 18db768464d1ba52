//! Shared types used by the vector index and its snapshot codec.

use serde::Serialize;
use thiserror::Error;

/// Errors returned by the vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Vector dimension differs from the dimension fixed at index creation.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was created with.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },
    /// Vector contains non-finite values or cannot be normalized.
    #[error("Invalid vector: {0}")]
    InvalidVector(String),
    /// Snapshot failed validation while loading.
    #[error("Index snapshot corrupted: {0}")]
    Corruption(String),
    /// Snapshot could not be encoded.
    #[error("Index snapshot encoding failed: {0}")]
    Encoding(String),
    /// Filesystem access failed.
    #[error("Index I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Similarity metric, fixed for the lifetime of an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Vectors and queries are L2-normalized by the index; scores are cosine similarities.
    Cosine,
    /// Vectors are used verbatim; callers own any normalization.
    InnerProduct,
}

impl Metric {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Cosine => 1,
            Self::InnerProduct => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Cosine),
            2 => Some(Self::InnerProduct),
            _ => None,
        }
    }
}

/// Lightweight metadata stored next to each vector for filtering and citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMetadata {
    /// Owning document.
    pub document_id: String,
    /// Category copied from the owning document.
    pub category: String,
}

/// Vector submitted to [`crate::index::VectorIndex::add`].
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Opaque chunk identity.
    pub chunk_id: String,
    /// Embedding produced for the chunk.
    pub vector: Vec<f32>,
    /// Filter and citation metadata.
    pub metadata: EntryMetadata,
}

/// Nearest-neighbor result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexHit {
    /// Chunk identity.
    pub chunk_id: String,
    /// Similarity under the index metric.
    pub score: f32,
    /// Metadata stored with the vector.
    pub metadata: EntryMetadata,
}

/// Optional constraints applied before ranking.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Only consider chunks of this category.
    pub category: Option<String>,
    /// Only consider chunks of this document.
    pub document_id: Option<String>,
}

impl SearchFilter {
    pub(crate) fn matches(&self, metadata: &EntryMetadata) -> bool {
        self.category
            .as_ref()
            .is_none_or(|category| *category == metadata.category)
            && self
                .document_id
                .as_ref()
                .is_none_or(|document| *document == metadata.document_id)
    }
}
