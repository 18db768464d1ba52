use async_trait::async_trait;
use rustyrag::config::{PipelineConfig, ThresholdStage};
use rustyrag::embedding::{Embedder, EmbeddingError, HashingEmbedder};
use rustyrag::error::RagError;
use rustyrag::generation::{ExtractiveGenerator, GenerationError, GenerationParams, Generator};
use rustyrag::metadata::DocumentFilter;
use rustyrag::pipeline::{
    DocumentUpdate, IngestStatus, NO_CONTEXT_ANSWER, NewDocument, QueryRequest, QueryStage,
    RagContext, RagPipeline,
};
use rustyrag::rerank::{NoopReranker, RerankCandidate, RerankError, Reranker};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SQLI: &str = "SQL injection uses single quotes to break out of database queries.";
const BLIND: &str = "Blind SQL injection infers data from timing differences.";
const PREPARED: &str = "Prepared statements keep SQL injection payloads out of the query.";

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 50,
        chunk_overlap: 10,
        autosave: false,
        ..PipelineConfig::default()
    }
}

fn pipeline_with(config: PipelineConfig, reranker: Arc<dyn Reranker>) -> RagPipeline {
    let ctx = RagContext::in_memory(
        config,
        Arc::new(HashingEmbedder::new(384)),
        Arc::new(ExtractiveGenerator),
        reranker,
    )
    .expect("context");
    RagPipeline::new(ctx).expect("pipeline")
}

fn pipeline() -> RagPipeline {
    pipeline_with(pipeline_config(), Arc::new(NoopReranker))
}

#[tokio::test]
async fn sql_injection_chunk_is_the_top_result_on_every_run() {
    let pipeline = pipeline();
    let ingested = pipeline
        .ingest(NewDocument::new(SQLI).with_category("web"))
        .await
        .expect("ingest");
    assert_eq!(ingested.status, IngestStatus::Created);
    assert_eq!(ingested.chunk_count, 1);

    for _ in 0..3 {
        let response = pipeline
            .query(QueryRequest::new("What is SQL injection?"))
            .await
            .expect("query");
        assert!(!response.no_context);
        assert_eq!(response.sources.len(), 1);
        assert_eq!(
            response.sources[0].chunk_id,
            format!("{}#0", ingested.document_id)
        );
        assert_eq!(response.sources[0].category, "web");
        assert!(response.sources[0].score >= 0.3);
        assert_eq!(response.answer, SQLI);
    }

    let metrics = pipeline.metrics_snapshot();
    assert_eq!(metrics.documents_ingested, 1);
    assert_eq!(metrics.queries_served, 3);
    assert_eq!(pipeline.recent_queries(10).await.expect("logs").len(), 3);
}

#[tokio::test]
async fn empty_index_answers_without_context() {
    let pipeline = pipeline();
    let response = pipeline
        .query(QueryRequest::new("What is SQL injection?"))
        .await
        .expect("query");

    assert!(response.no_context);
    assert!(response.sources.is_empty());
    assert_eq!(response.answer, NO_CONTEXT_ANSWER);

    let logs = pipeline.recent_queries(1).await.expect("logs");
    assert!(logs[0].no_context);
    assert!(logs[0].error.is_none());
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let pipeline = pipeline();
    let first = pipeline.ingest(NewDocument::new(SQLI)).await.expect("first");
    let second = pipeline
        .ingest(NewDocument::new(SQLI).with_source("copy.txt"))
        .await
        .expect("second");

    assert_eq!(second.status, IngestStatus::Duplicate);
    assert_eq!(second.document_id, first.document_id);
    let stats = pipeline.stats().await;
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.chunk_count, first.chunk_count);
    assert_eq!(stats.index_size, first.chunk_count);
    assert_eq!(pipeline.metrics_snapshot().duplicates_skipped, 1);
}

#[tokio::test]
async fn concurrent_duplicate_ingests_create_one_document() {
    let pipeline = Arc::new(pipeline());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.ingest(NewDocument::new(SQLI)).await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        let outcome = handle.await.expect("join").expect("ingest");
        if outcome.status == IngestStatus::Created {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(pipeline.stats().await.document_count, 1);
}

#[tokio::test]
async fn deleting_a_document_removes_its_chunks_from_retrieval() {
    let pipeline = pipeline();
    let ingested = pipeline.ingest(NewDocument::new(SQLI)).await.expect("ingest");

    pipeline.delete(&ingested.document_id).await.expect("delete");

    let response = pipeline
        .query(QueryRequest::new("What is SQL injection?"))
        .await
        .expect("query");
    assert!(response.no_context);
    assert_eq!(pipeline.stats().await.index_size, 0);
    assert!(matches!(
        pipeline.document(&ingested.document_id).await,
        Err(RagError::NotFound(_))
    ));
    assert!(matches!(
        pipeline.delete(&ingested.document_id).await,
        Err(RagError::NotFound(_))
    ));

    // Deleted content can be ingested again as a fresh document.
    let again = pipeline.ingest(NewDocument::new(SQLI)).await.expect("re-ingest");
    assert_eq!(again.status, IngestStatus::Created);
    assert_ne!(again.document_id, ingested.document_id);
}

#[tokio::test]
async fn batch_failures_do_not_affect_other_documents() {
    let pipeline = pipeline();
    let outcome = pipeline
        .ingest_batch(vec![
            NewDocument::new(SQLI).with_source("sqli.md"),
            NewDocument::new("   ").with_source("blank.md"),
            NewDocument::new("Cross-site scripting injects script into trusted pages.")
                .with_source("xss.md"),
        ])
        .await;

    assert_eq!(outcome.succeeded.len(), 2);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].index, 1);
    assert_eq!(outcome.failed[0].source.as_deref(), Some("blank.md"));
    assert!(matches!(outcome.failed[0].error, RagError::Validation(_)));
    assert_eq!(pipeline.stats().await.document_count, 2);
}

#[tokio::test]
async fn category_filter_and_metadata_updates_reach_retrieval() {
    let pipeline = pipeline();
    let ingested = pipeline
        .ingest(NewDocument::new(SQLI).with_category("Web").with_tags(["SQLi", "sqli"]))
        .await
        .expect("ingest");

    let document = pipeline.document(&ingested.document_id).await.expect("doc");
    assert_eq!(document.category, "web");
    assert_eq!(document.tags, vec!["sqli".to_string()]);

    let filtered = pipeline
        .retrieve("SQL injection", None, Some("crypto".into()))
        .await
        .expect("retrieve");
    assert!(filtered.is_empty());

    pipeline
        .update_document(
            &ingested.document_id,
            DocumentUpdate {
                category: Some("crypto".into()),
                tags: None,
            },
        )
        .await
        .expect("update");
    let filtered = pipeline
        .retrieve("SQL injection", None, Some("crypto".into()))
        .await
        .expect("retrieve");
    assert_eq!(filtered.len(), 1);

    let listed = pipeline
        .list_documents(DocumentFilter {
            category: Some("crypto".into()),
            ..DocumentFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn invalid_queries_are_rejected_before_any_work() {
    let pipeline = pipeline();
    assert!(matches!(
        pipeline.query(QueryRequest::new("   ")).await,
        Err(RagError::Validation(_))
    ));
    assert!(matches!(
        pipeline.query(QueryRequest::new("sql").with_top_k(0)).await,
        Err(RagError::Validation(_))
    ));
    assert!(matches!(
        pipeline.query(QueryRequest::new("sql").with_top_k(1_000)).await,
        Err(RagError::Validation(_))
    ));
    assert_eq!(pipeline.stats().await.query_count, 0);
}

struct StalledEmbedder;

#[async_trait]
impl Embedder for StalledEmbedder {
    fn dimension(&self) -> usize {
        384
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(EmbeddingError::Unavailable("never answers".into()))
    }
}

fn stalled_pipeline() -> RagPipeline {
    let config = PipelineConfig {
        upstream_timeout: Duration::from_millis(50),
        max_retries: 0,
        ..pipeline_config()
    };
    let ctx = RagContext::in_memory(
        config,
        Arc::new(StalledEmbedder),
        Arc::new(ExtractiveGenerator),
        Arc::new(NoopReranker),
    )
    .expect("context");
    RagPipeline::new(ctx).expect("pipeline")
}

#[tokio::test]
async fn stalled_embedder_times_out_and_is_logged() {
    let pipeline = stalled_pipeline();
    let error = pipeline
        .query(QueryRequest::new("What is SQL injection?"))
        .await
        .expect_err("timeout");

    assert!(matches!(
        error,
        RagError::UpstreamTimeout {
            stage: QueryStage::Embedding,
            ..
        }
    ));
    let logs = pipeline.recent_queries(1).await.expect("logs");
    assert_eq!(logs[0].failed_stage, Some(QueryStage::Embedding));
    assert!(logs[0].answer.is_none());
    assert_eq!(pipeline.metrics_snapshot().queries_failed, 1);
}

#[tokio::test]
async fn cancelled_query_stops_waiting_on_upstream() {
    let pipeline = stalled_pipeline();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = pipeline
        .query_with_cancel(QueryRequest::new("What is SQL injection?"), cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(error, RagError::Cancelled));
}

/// Reranker that invents candidates, repeats one and ignores `top_n`.
struct UnrulyReranker;

#[async_trait]
impl Reranker for UnrulyReranker {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn rerank(
        &self,
        _query: &str,
        candidates: Vec<RerankCandidate>,
        _top_n: usize,
    ) -> Result<Vec<RerankCandidate>, RerankError> {
        let mut output = vec![RerankCandidate {
            chunk_id: "invented#0".into(),
            text: "not retrieved".into(),
            score: 9.0,
        }];
        for candidate in candidates.iter().rev() {
            output.push(RerankCandidate {
                score: 1.0,
                ..candidate.clone()
            });
            output.push(RerankCandidate {
                score: 0.5,
                ..candidate.clone()
            });
        }
        Ok(output)
    }
}

#[tokio::test]
async fn reranker_output_is_limited_to_retrieved_candidates() {
    let config = PipelineConfig {
        reranker_enabled: true,
        rerank_top_n: 2,
        similarity_threshold: 0.0,
        ..pipeline_config()
    };
    let pipeline = pipeline_with(config, Arc::new(UnrulyReranker));
    for content in [SQLI, BLIND, PREPARED] {
        pipeline.ingest(NewDocument::new(content)).await.expect("ingest");
    }
    let retrieved = pipeline
        .retrieve("SQL injection", Some(3), None)
        .await
        .expect("retrieve");
    let retrieved_ids: Vec<_> = retrieved.iter().map(|s| s.chunk_id.clone()).collect();

    let response = pipeline
        .query(QueryRequest::new("SQL injection").with_top_k(3))
        .await
        .expect("query");

    assert!(response.sources.len() <= 2);
    assert!(!response.sources.is_empty());
    let mut seen = std::collections::HashSet::new();
    for source in &response.sources {
        assert!(retrieved_ids.contains(&source.chunk_id));
        assert!(seen.insert(source.chunk_id.clone()));
    }
}

#[tokio::test]
async fn hits_below_the_threshold_leave_the_query_without_context() {
    let config = PipelineConfig {
        similarity_threshold: 0.99,
        ..pipeline_config()
    };
    let pipeline = pipeline_with(config, Arc::new(NoopReranker));
    pipeline.ingest(NewDocument::new(SQLI)).await.expect("ingest");
    assert_eq!(pipeline.stats().await.index_size, 1);

    let response = pipeline
        .query(QueryRequest::new("What is SQL injection?"))
        .await
        .expect("query");
    assert!(response.no_context);
    assert!(response.sources.is_empty());
    assert_eq!(response.answer, NO_CONTEXT_ANSWER);
    assert_eq!(pipeline.metrics_snapshot().queries_without_context, 1);

    let retrieved = pipeline
        .retrieve("What is SQL injection?", None, None)
        .await
        .expect("retrieve");
    assert!(retrieved.is_empty());
}

/// Reranker that favours passages about prepared statements and counts what it was shown.
#[derive(Default)]
struct PreparedStatementReranker {
    seen: AtomicUsize,
}

#[async_trait]
impl Reranker for PreparedStatementReranker {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn rerank(
        &self,
        _query: &str,
        candidates: Vec<RerankCandidate>,
        _top_n: usize,
    ) -> Result<Vec<RerankCandidate>, RerankError> {
        self.seen.fetch_add(candidates.len(), Ordering::SeqCst);
        let mut scored: Vec<RerankCandidate> = candidates
            .into_iter()
            .map(|candidate| RerankCandidate {
                score: if candidate.text.contains("Prepared") {
                    0.9
                } else {
                    0.1
                },
                ..candidate
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scored)
    }
}

fn rerank_config(threshold_stage: ThresholdStage) -> PipelineConfig {
    PipelineConfig {
        reranker_enabled: true,
        rerank_top_n: 3,
        similarity_threshold: 0.8,
        threshold_stage,
        ..pipeline_config()
    }
}

#[tokio::test]
async fn threshold_after_rerank_filters_on_reranker_scores() {
    let reranker = Arc::new(PreparedStatementReranker::default());
    let pipeline = pipeline_with(rerank_config(ThresholdStage::AfterRerank), reranker.clone());
    for content in [SQLI, BLIND, PREPARED] {
        pipeline.ingest(NewDocument::new(content)).await.expect("ingest");
    }

    let response = pipeline
        .query(QueryRequest::new("SQL injection").with_top_k(3))
        .await
        .expect("query");

    // Every vector score is below 0.8, so only the reranker can let a passage through.
    assert_eq!(reranker.seen.load(Ordering::SeqCst), 3);
    assert!(!response.no_context);
    assert_eq!(response.sources.len(), 1);
    assert!((response.sources[0].score - 0.9).abs() < 1e-6);
    assert_eq!(response.answer, PREPARED);
}

#[tokio::test]
async fn threshold_before_rerank_skips_the_reranker_when_nothing_passes() {
    let reranker = Arc::new(PreparedStatementReranker::default());
    let pipeline = pipeline_with(rerank_config(ThresholdStage::BeforeRerank), reranker.clone());
    for content in [SQLI, BLIND, PREPARED] {
        pipeline.ingest(NewDocument::new(content)).await.expect("ingest");
    }

    let response = pipeline
        .query(QueryRequest::new("SQL injection").with_top_k(3))
        .await
        .expect("query");

    assert!(response.no_context);
    assert_eq!(reranker.seen.load(Ordering::SeqCst), 0);
}

struct StalledGenerator;

#[async_trait]
impl Generator for StalledGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".into())
    }
}

#[tokio::test]
async fn stalled_generator_times_out_instead_of_answering_without_context() {
    let config = PipelineConfig {
        upstream_timeout: Duration::from_millis(50),
        max_retries: 0,
        ..pipeline_config()
    };
    let ctx = RagContext::in_memory(
        config,
        Arc::new(HashingEmbedder::new(384)),
        Arc::new(StalledGenerator),
        Arc::new(NoopReranker),
    )
    .expect("context");
    let pipeline = RagPipeline::new(ctx).expect("pipeline");
    pipeline.ingest(NewDocument::new(SQLI)).await.expect("ingest");

    let error = pipeline
        .query(QueryRequest::new("What is SQL injection?"))
        .await
        .expect_err("timeout");

    assert!(matches!(
        error,
        RagError::UpstreamTimeout {
            stage: QueryStage::Generating,
            ..
        }
    ));
    let logs = pipeline.recent_queries(1).await.expect("logs");
    assert_eq!(logs[0].failed_stage, Some(QueryStage::Generating));
    assert!(!logs[0].no_context);
    let metrics = pipeline.metrics_snapshot();
    assert_eq!(metrics.queries_failed, 1);
    assert_eq!(metrics.queries_without_context, 0);
}

#[tokio::test]
async fn clearing_the_index_removes_every_document_but_keeps_query_logs() {
    let pipeline = pipeline();
    for content in [SQLI, BLIND] {
        pipeline.ingest(NewDocument::new(content)).await.expect("ingest");
    }
    pipeline
        .query(QueryRequest::new("What is SQL injection?"))
        .await
        .expect("query");

    let outcome = pipeline.clear_index().await.expect("clear");
    assert_eq!(outcome.documents_removed, 2);
    assert_eq!(outcome.vectors_removed, 2);

    let stats = pipeline.stats().await;
    assert_eq!(stats.document_count, 0);
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(stats.index_size, 0);
    assert_eq!(stats.query_count, 1);
    assert!(
        pipeline
            .query(QueryRequest::new("What is SQL injection?"))
            .await
            .expect("query")
            .no_context
    );

    let again = pipeline.clear_index().await.expect("clear empty");
    assert_eq!((again.documents_removed, again.vectors_removed), (0, 0));
    let reingested = pipeline.ingest(NewDocument::new(SQLI)).await.expect("ingest");
    assert_eq!(reingested.status, IngestStatus::Created);
}
