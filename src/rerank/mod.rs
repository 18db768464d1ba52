//! Optional second-stage relevance scoring.
//!
//! The pipeline picks one of two [`Reranker`] variants at construction time:
//!
//! - [`NoopReranker`] reports itself disabled, and the pipeline skips the stage entirely.
//! - [`ModelReranker`] scores each (query, passage) pair with a [`RelevanceModel`] and keeps the
//!   best `top_n`.
//!
//! Whatever a reranker returns, [`enforce_subset`] makes sure the output only contains input
//! candidates, without repeats, and never more than requested.

mod http;
mod lexical;

pub use http::CrossEncoderClient;
pub use lexical::LexicalRelevance;

use crate::config::{Config, RerankerProvider};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by relevance models.
#[derive(Debug, Error)]
pub enum RerankError {
    /// Relevance service could not be reached.
    #[error("Reranker unavailable: {0}")]
    Unavailable(String),
    /// Relevance service answered with something unusable.
    #[error("Malformed reranker response: {0}")]
    InvalidResponse(String),
}

/// Candidate passage flowing through the reranking stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankCandidate {
    /// Chunk identity; the only key the discipline checks rely on.
    pub chunk_id: String,
    /// Passage text shown to the relevance model.
    pub text: String,
    /// Current score (retrieval similarity on input, relevance on output).
    pub score: f32,
}

/// Pairwise relevance scorer used by [`ModelReranker`].
#[async_trait]
pub trait RelevanceModel: Send + Sync {
    /// Score every passage against the query; output is aligned with `passages`.
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError>;
}

/// Second-stage reranker interface.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// `false` means the pipeline must not run the reranking stage at all.
    fn is_enabled(&self) -> bool;

    /// Reorder and truncate `candidates` to at most `top_n` entries.
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> Result<Vec<RerankCandidate>, RerankError>;
}

/// Disabled reranker; retrieval order is final.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> Result<Vec<RerankCandidate>, RerankError> {
        candidates.truncate(top_n);
        Ok(candidates)
    }
}

/// Reranker backed by a pairwise [`RelevanceModel`].
pub struct ModelReranker {
    model: Arc<dyn RelevanceModel>,
}

impl ModelReranker {
    /// Wrap a relevance model.
    pub fn new(model: Arc<dyn RelevanceModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Reranker for ModelReranker {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> Result<Vec<RerankCandidate>, RerankError> {
        if candidates.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }
        let passages: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let scores = self.model.score(query, &passages).await?;
        if scores.len() != candidates.len() {
            return Err(RerankError::InvalidResponse(format!(
                "expected {} scores, got {}",
                candidates.len(),
                scores.len()
            )));
        }

        let mut rescored: Vec<RerankCandidate> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| RerankCandidate { score, ..candidate })
            .collect();
        // Stable sort keeps retrieval order among equal relevance scores.
        rescored.sort_by(|a, b| b.score.total_cmp(&a.score));
        rescored.truncate(top_n);
        Ok(rescored)
    }
}

/// Restrict reranker output to input identities, drop repeats, and cap at `top_n`.
pub fn enforce_subset(
    input_ids: &HashSet<String>,
    output: Vec<RerankCandidate>,
    top_n: usize,
) -> Vec<RerankCandidate> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(output.len().min(top_n));
    for candidate in output {
        if kept.len() == top_n {
            break;
        }
        if !input_ids.contains(&candidate.chunk_id) {
            tracing::warn!(chunk_id = %candidate.chunk_id, "Reranker returned unknown candidate; dropping");
            continue;
        }
        if seen.insert(candidate.chunk_id.clone()) {
            kept.push(candidate);
        }
    }
    kept
}

/// Build the reranker selected by configuration.
pub fn build_reranker(config: &Config) -> Arc<dyn Reranker> {
    match (config.reranker_provider, config.reranker_url.as_ref()) {
        (RerankerProvider::None, _) => Arc::new(NoopReranker),
        (RerankerProvider::Lexical, _) => Arc::new(ModelReranker::new(Arc::new(LexicalRelevance))),
        (RerankerProvider::Http, Some(url)) => Arc::new(ModelReranker::new(Arc::new(
            CrossEncoderClient::new(url.clone()),
        ))),
        (RerankerProvider::Http, None) => {
            tracing::warn!("RERANKER_URL missing for http reranker; reranking disabled");
            Arc::new(NoopReranker)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, text: &str, score: f32) -> RerankCandidate {
        RerankCandidate {
            chunk_id: id.into(),
            text: text.into(),
            score,
        }
    }

    struct FixedScores(Vec<f32>);

    #[async_trait]
    impl RelevanceModel for FixedScores {
        async fn score(&self, _query: &str, _passages: &[&str]) -> Result<Vec<f32>, RerankError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn model_reranker_reorders_and_truncates() {
        let reranker = ModelReranker::new(Arc::new(FixedScores(vec![0.1, 0.9, 0.5])));
        let output = reranker
            .rerank(
                "query",
                vec![
                    candidate("a", "alpha", 0.8),
                    candidate("b", "beta", 0.7),
                    candidate("c", "gamma", 0.6),
                ],
                2,
            )
            .await
            .expect("rerank");
        let ids: Vec<_> = output.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!((output[0].score - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn model_reranker_rejects_misaligned_scores() {
        let reranker = ModelReranker::new(Arc::new(FixedScores(vec![0.1])));
        let error = reranker
            .rerank(
                "query",
                vec![candidate("a", "alpha", 0.8), candidate("b", "beta", 0.7)],
                2,
            )
            .await
            .expect_err("misaligned");
        assert!(matches!(error, RerankError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn noop_reranker_is_disabled() {
        assert!(!NoopReranker.is_enabled());
        let output = NoopReranker
            .rerank("q", vec![candidate("a", "alpha", 0.8)], 5)
            .await
            .expect("noop");
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn enforce_subset_drops_foreign_and_repeated_ids() {
        let input: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let output = vec![
            candidate("x", "intruder", 1.0),
            candidate("b", "beta", 0.9),
            candidate("b", "beta", 0.9),
            candidate("a", "alpha", 0.5),
        ];
        let kept = enforce_subset(&input, output, 5);
        let ids: Vec<_> = kept.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn enforce_subset_caps_output() {
        let input: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let output = vec![
            candidate("a", "alpha", 0.9),
            candidate("b", "beta", 0.8),
            candidate("c", "gamma", 0.7),
        ];
        assert_eq!(enforce_subset(&input, output, 2).len(), 2);
    }
}
