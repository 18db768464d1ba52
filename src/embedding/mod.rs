//! Embedding capability consumed by the pipeline.
//!
//! The pipeline never assumes embeddings are normalized: the vector index owns normalization for
//! its metric. Adapters only promise a fixed dimension and determinism for a given model version.

pub(crate) mod hashing;
mod ollama;

pub use hashing::HashingEmbedder;
pub use ollama::OllamaEmbedder;

use crate::config::{Config, EmbeddingProvider};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Text cannot be embedded (for example, it is empty).
    #[error("Invalid embedding input: {0}")]
    InvalidInput(String),
    /// Provider could not be reached.
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),
    /// Provider answered with an error status.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider response could not be decoded.
    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::GenerationFailed(_))
    }
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimension of every vector returned by [`Embedder::embed`].
    fn dimension(&self) -> usize;

    /// Produce an embedding vector for a single piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Build the embedder selected by configuration.
pub fn build_embedder(config: &Config) -> Arc<dyn Embedder> {
    match config.embedding_provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.embedding_dimension)),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
            config.ollama_url.clone(),
            config.embedding_model.clone(),
            config.embedding_dimension,
        )),
    }
}
