//! Document, chunk and query-log records plus the store abstraction that owns them.

mod local;

pub use local::LocalMetadataStore;

use crate::pipeline::QueryStage;
use crate::storage::SnapshotStamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by metadata store implementations.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Requested document does not exist.
    #[error("document '{0}' not found")]
    NotFound(String),
    /// Persisted store failed validation.
    #[error("document store corrupted: {0}")]
    Corruption(String),
    /// Filesystem access failed.
    #[error("document store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be encoded or decoded.
    #[error("document store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The snapshot envelope could not be sealed.
    #[error("document store encoding failed: {0}")]
    Encoding(String),
}

/// Ingested document. Immutable after creation apart from category and tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// UUID v4 identity.
    pub id: String,
    /// SHA-256 hex digest of the raw content bytes.
    pub content_hash: String,
    /// Optional path or URI the content came from.
    pub source: Option<String>,
    /// Category used for filtering; `general` when not supplied.
    pub category: String,
    /// Trimmed, lower-cased, deduplicated tags.
    pub tags: Vec<String>,
    /// Free-form notes supplied at ingestion.
    pub notes: Option<String>,
    /// Size of the raw content in bytes.
    pub size_bytes: u64,
    /// RFC 3339 UTC creation timestamp.
    pub created_at: String,
    /// Number of chunks derived from the content.
    pub chunk_count: usize,
}

/// Stored passage of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk identity shared with the vector index.
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Position within the document, starting at zero.
    pub ordinal: usize,
    /// Exact chunk text.
    pub text: String,
    /// Number of whitespace tokens in the chunk.
    pub token_count: usize,
    /// Byte offset of the first character within the document.
    pub byte_start: usize,
    /// Byte offset one past the last character within the document.
    pub byte_end: usize,
}

/// Chunk identity and score captured in a query log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Chunk identity.
    pub chunk_id: String,
    /// Score the chunk was selected with.
    pub score: f32,
}

/// Append-only record of a served or failed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLog {
    /// UUID v4 identity.
    pub id: String,
    /// Query text as submitted.
    pub query_text: String,
    /// Chunks used as context, in prompt order.
    pub retrieved: Vec<RetrievedChunk>,
    /// Final answer, absent for failed queries.
    pub answer: Option<String>,
    /// Whether the query short-circuited because nothing passed the threshold.
    pub no_context: bool,
    /// Error text when the query failed.
    pub error: Option<String>,
    /// Stage that was active when the query failed.
    pub failed_stage: Option<QueryStage>,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// Wall-clock latency of the request.
    pub latency_ms: u64,
}

/// Constraints applied by [`MetadataStore::list`].
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Only documents with this category.
    pub category: Option<String>,
    /// Only documents carrying this tag.
    pub tag: Option<String>,
    /// Maximum number of documents returned.
    pub limit: Option<usize>,
}

/// Record counts reported by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    /// Stored documents.
    pub documents: usize,
    /// Stored chunks across all documents.
    pub chunks: usize,
    /// Logged queries.
    pub queries: usize,
}

/// Persistence boundary for documents, chunks and query logs.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Record a new document together with all of its chunks.
    async fn record_document(
        &self,
        document: Document,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), MetadataError>;

    /// Look up a document by content digest.
    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Document>, MetadataError>;

    /// Fetch a document by id.
    async fn get(&self, document_id: &str) -> Result<Document, MetadataError>;

    /// Fetch chunks in the order of `chunk_ids`, skipping unknown ids.
    async fn chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>, MetadataError>;

    /// All chunks of a document in ordinal order.
    async fn chunks_for(&self, document_id: &str) -> Result<Vec<ChunkRecord>, MetadataError>;

    /// Documents matching `filter`, newest first.
    async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>, MetadataError>;

    /// Replace category and/or tags of an existing document.
    async fn update_metadata(
        &self,
        document_id: &str,
        category: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Document, MetadataError>;

    /// Remove a document and its chunks, returning them when the document existed.
    async fn delete(
        &self,
        document_id: &str,
    ) -> Result<Option<(Document, Vec<String>)>, MetadataError>;

    /// Append a query log entry.
    async fn record_query(&self, log: QueryLog) -> Result<(), MetadataError>;

    /// Most recent query logs, newest first.
    async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLog>, MetadataError>;

    /// Current record counts.
    async fn counts(&self) -> StoreCounts;

    /// Persist documents and chunks under `stamp`.
    async fn flush(&self, stamp: SnapshotStamp) -> Result<(), MetadataError>;

    /// Stamp of the last flush or load, if any.
    async fn stamp(&self) -> Option<SnapshotStamp>;
}

/// Current time as an RFC 3339 UTC string.
pub(crate) fn now_rfc3339() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc().unix_timestamp().to_string())
}
