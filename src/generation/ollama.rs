use super::{GenerationError, GenerationParams, Generator};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Generator issuing non-streaming `POST /api/generate` requests to an Ollama runtime.
pub struct OllamaGenerator {
    http: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

impl OllamaGenerator {
    /// Construct an adapter for `model` served at `base_url`.
    pub fn new(base_url: String, model: String) -> Self {
        let http = Client::builder()
            .user_agent("rusty-rag/generate")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url,
            model,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let mut options = Map::new();
        options.insert("temperature".into(), json!(params.temperature));
        if let Some(max_tokens) = params.max_tokens {
            options.insert("num_predict".into(), json!(max_tokens));
        }
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": Value::Object(options),
        });

        let endpoint = self.url("api/generate");
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                GenerationError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GenerationError::InvalidResponse(format!(
                "Ollama endpoint {endpoint} returned 404 (is model '{}' pulled?)",
                self.model
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            GenerationError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if !body.done {
            return Err(GenerationError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response.trim().to_string())
    }

    async fn health_check(&self) -> Result<(), GenerationError> {
        let response = self
            .http
            .get(self.url("api/tags"))
            .send()
            .await
            .map_err(|error| GenerationError::Unavailable(error.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GenerationError::Unavailable(format!(
                "Ollama health probe returned {}",
                response.status()
            )))
        }
    }
}
