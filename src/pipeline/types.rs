//! Request and response types exchanged with the pipeline.

use crate::error::RagError;
use serde::{Deserialize, Serialize};

/// Answer returned when nothing clears the similarity threshold.
pub const NO_CONTEXT_ANSWER: &str =
    "No relevant context was found in the knowledge base for this query.";

/// Raw document submitted for ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDocument {
    /// Full text content.
    pub content: String,
    /// Optional path or URI the content came from.
    #[serde(default)]
    pub source: Option<String>,
    /// Optional category; defaults to `general`.
    #[serde(default)]
    pub category: Option<String>,
    /// Optional tags; normalized before storage.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional free-form notes.
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewDocument {
    /// Document with content only.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set the source reference.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Whether an ingest created a new document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Content was new and has been indexed.
    Created,
    /// Identical content was already indexed; nothing changed.
    Duplicate,
}

/// Result of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Identity of the new or existing document.
    pub document_id: String,
    /// Created or duplicate.
    pub status: IngestStatus,
    /// Chunks belonging to the document.
    pub chunk_count: usize,
}

/// Per-document failure inside a batch.
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the document in the submitted batch.
    pub index: usize,
    /// Source reference of the failed document, when supplied.
    pub source: Option<String>,
    /// Why the document was rejected.
    pub error: RagError,
}

/// Result of [`crate::pipeline::RagPipeline::ingest_batch`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Successful ingests in submission order.
    pub succeeded: Vec<IngestOutcome>,
    /// Failed ingests in submission order.
    pub failed: Vec<BatchFailure>,
}

/// Options for [`crate::pipeline::RagPipeline::ingest_directory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryOptions {
    /// Descend into subdirectories.
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// File extensions to include, without the leading dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Category applied to every ingested file.
    #[serde(default)]
    pub category: Option<String>,
    /// Tags applied to every ingested file.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_recursive() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec!["txt".into(), "md".into()]
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            recursive: default_recursive(),
            extensions: default_extensions(),
            category: None,
            tags: Vec::new(),
        }
    }
}

/// Query submitted to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Natural-language question.
    pub query: String,
    /// Candidates to retrieve; defaults to the configured `top_k`.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Include the supporting passages in the response.
    #[serde(default = "default_return_sources")]
    pub return_sources: bool,
    /// Only consider chunks of this category.
    #[serde(default)]
    pub category: Option<String>,
}

fn default_return_sources() -> bool {
    true
}

impl QueryRequest {
    /// Query with default options.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            return_sources: true,
            category: None,
        }
    }

    /// Override the number of candidates retrieved.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// Passage used as context for an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    /// Chunk identity.
    pub chunk_id: String,
    /// Owning document.
    pub document_id: String,
    /// Category of the owning document.
    pub category: String,
    /// Similarity or relevance score the passage was ranked with.
    pub score: f32,
    /// Passage text, possibly truncated for display.
    pub text: String,
}

/// Answer produced by [`crate::pipeline::RagPipeline::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    /// Query log identity.
    pub query_id: String,
    /// Generated answer, or the fixed no-context message.
    pub answer: String,
    /// Supporting passages, empty unless requested.
    pub sources: Vec<Source>,
    /// Whether no passage cleared the similarity threshold.
    pub no_context: bool,
    /// Wall-clock latency of the request.
    pub latency_ms: u64,
}

/// Store and index counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Stored documents.
    pub document_count: usize,
    /// Stored chunks.
    pub chunk_count: usize,
    /// Vectors in the index.
    pub index_size: usize,
    /// Logged queries.
    pub query_count: usize,
    /// Embedding dimension of the index.
    pub dimension: usize,
}

/// What a full index reset removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    /// Documents deleted from the store.
    pub documents_removed: usize,
    /// Vectors dropped from the index.
    pub vectors_removed: usize,
}

/// Reachability of the pipeline and its upstream services.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    /// `ok` when every component answered, `degraded` otherwise.
    pub status: &'static str,
    /// Whether the generator health probe succeeded.
    pub generator_reachable: bool,
    /// Diagnostic from a failed generator probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_error: Option<String>,
    /// Whether the reranking stage is active.
    pub reranker_enabled: bool,
    /// Vectors in the index.
    pub index_size: usize,
    /// RFC 3339 UTC probe time.
    pub timestamp: String,
}

/// Category and tag changes applied by [`crate::pipeline::RagPipeline::update_document`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdate {
    /// New category.
    #[serde(default)]
    pub category: Option<String>,
    /// Replacement tag set.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}
