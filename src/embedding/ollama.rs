use super::{Embedder, EmbeddingError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

/// Embedding adapter issuing `POST /api/embeddings` requests to an Ollama runtime.
pub struct OllamaEmbedder {
    http: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    /// Construct an adapter for `model` served at `base_url`.
    pub fn new(base_url: String, model: String, dimension: usize) -> Self {
        let http = Client::builder()
            .user_agent("rusty-rag/embed")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url,
            model,
            dimension,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("no text provided".to_string()));
        }

        tracing::trace!(model = %self.model, chars = text.len(), "Requesting Ollama embedding");
        let response = self
            .http
            .post(self.endpoint())
            .json(&json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .await
            .map_err(|error| {
                EmbeddingError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(EmbeddingError::InvalidResponse(format!(
                "Ollama endpoint {} returned 404 (is model '{}' pulled?)",
                self.endpoint(),
                self.model
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaEmbeddingResponse = response.json().await.map_err(|error| {
            EmbeddingError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if body.embedding.len() != self.dimension {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} dimensions from model '{}', got {}",
                self.dimension,
                self.model,
                body.embedding.len()
            )));
        }

        Ok(body.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn client(server: &MockServer, dimension: usize) -> OllamaEmbedder {
        OllamaEmbedder::new(server.base_url(), "nomic-embed-text".into(), dimension)
    }

    #[tokio::test]
    async fn returns_embedding_from_successful_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embeddings")
                    .json_body_partial(r#"{"model":"nomic-embed-text"}"#);
                then.status(200)
                    .json_body(json!({ "embedding": [0.1, 0.2, 0.3] }));
            })
            .await;

        let vector = client(&server, 3).embed("hello").await.expect("embedding");

        mock.assert();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(503).body("loading model");
            })
            .await;

        let error = client(&server, 3).embed("hello").await.expect_err("error");
        assert!(matches!(error, EmbeddingError::GenerationFailed(ref message) if message.contains("503")));
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(200).json_body(json!({ "embedding": [0.1, 0.2] }));
            })
            .await;

        let error = client(&server, 3).embed("hello").await.expect_err("error");
        assert!(matches!(error, EmbeddingError::InvalidResponse(_)));
        assert!(!error.is_transient());
    }
}
