use super::{RelevanceModel, RerankError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

/// Cross-encoder served over HTTP using the text-embeddings-inference `POST /rerank` format.
///
/// The service receives the query and all passages in one request and answers with
/// `[{ "index": i, "score": s }, ...]` in arbitrary order.
pub struct CrossEncoderClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RankedPassage {
    index: usize,
    score: f32,
}

impl CrossEncoderClient {
    /// Construct a client for the service rooted at `base_url`.
    pub fn new(base_url: String) -> Self {
        let http = Client::builder()
            .user_agent("rusty-rag/rerank")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http, base_url }
    }

    fn endpoint(&self) -> String {
        format!("{}/rerank", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RelevanceModel for CrossEncoderClient {
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankError> {
        let response = self
            .http
            .post(self.endpoint())
            .json(&json!({
                "query": query,
                "texts": passages,
                "raw_scores": false,
            }))
            .send()
            .await
            .map_err(|error| {
                RerankError::Unavailable(format!(
                    "failed to reach reranker at {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RerankError::Unavailable(format!(
                "reranker returned {status}: {body}"
            )));
        }

        let ranked: Vec<RankedPassage> = response.json().await.map_err(|error| {
            RerankError::InvalidResponse(format!("failed to decode reranker response: {error}"))
        })?;

        let mut scores = vec![None; passages.len()];
        for entry in ranked {
            let slot = scores.get_mut(entry.index).ok_or_else(|| {
                RerankError::InvalidResponse(format!(
                    "reranker referenced passage {} of {}",
                    entry.index,
                    passages.len()
                ))
            })?;
            *slot = Some(entry.score);
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| {
                score.ok_or_else(|| {
                    RerankError::InvalidResponse(format!("reranker omitted passage {index}"))
                })
            })
            .collect()
    }
}
