//! Text generation capability used to phrase grounded answers.
//!
//! Generators are black boxes to the pipeline beyond timeout and retry handling. The Ollama
//! adapter talks to a local runtime; the extractive generator needs no model at all and answers
//! with the highest ranked passage, which keeps the service usable offline.

mod ollama;

pub use ollama::OllamaGenerator;

use crate::config::{Config, GeneratorProvider};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced while generating an answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Prompt cannot be processed.
    #[error("Invalid generation input: {0}")]
    InvalidInput(String),
    /// Provider could not be reached.
    #[error("Generation provider unavailable: {0}")]
    Unavailable(String),
    /// Provider returned an error response.
    #[error("Failed to generate answer: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::GenerationFailed(_))
    }
}

/// Sampling parameters forwarded to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional cap on generated tokens.
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: None,
        }
    }
}

/// Interface implemented by answer generators.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce an answer for a fully assembled prompt.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;

    /// Probe the provider; offline generators are always healthy.
    async fn health_check(&self) -> Result<(), GenerationError> {
        Ok(())
    }
}

/// Marker lines used by the prompt builder around each passage.
pub(crate) const PASSAGE_START: &str = "<<<passage>>>";
pub(crate) const PASSAGE_END: &str = "<<<end>>>";

/// Generator that answers with the first passage embedded in the prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveGenerator;

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let passage = prompt
            .split_once(PASSAGE_START)
            .and_then(|(_, rest)| rest.split_once(PASSAGE_END))
            .map(|(passage, _)| passage.trim())
            .filter(|passage| !passage.is_empty())
            .ok_or_else(|| {
                GenerationError::InvalidInput("prompt contains no context passage".into())
            })?;
        // Drop the citation header line, keep the passage body.
        let body = passage
            .split_once('\n')
            .map(|(_, body)| body.trim())
            .unwrap_or(passage);
        Ok(body.to_string())
    }
}

/// Build the generator selected by configuration.
pub fn build_generator(config: &Config) -> Arc<dyn Generator> {
    match config.generator_provider {
        GeneratorProvider::Extractive => Arc::new(ExtractiveGenerator),
        GeneratorProvider::Ollama => Arc::new(OllamaGenerator::new(
            config.ollama_url.clone(),
            config.llm_model.clone(),
        )),
    }
}
