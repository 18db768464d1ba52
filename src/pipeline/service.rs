//! RAG pipeline coordinating chunking, embedding, the vector index and answer generation.

use super::{
    chunking::Chunker,
    dedup::{Deduplicator, content_digest},
    prompt::{ContextPassage, build_prompt},
    retry::{RetryPolicy, with_retry},
    sanitize::{sanitize_category, sanitize_string, sanitize_tags},
    state::{QueryRun, QueryStage},
    types::{
        BatchFailure, BatchOutcome, ClearOutcome, DirectoryOptions, DocumentUpdate, Health,
        IngestOutcome, IngestStatus, NO_CONTEXT_ANSWER, NewDocument, QueryRequest, QueryResponse,
        Source, Stats,
    },
};
use crate::{
    config::{Config, PipelineConfig, ThresholdStage},
    embedding::{Embedder, build_embedder},
    error::RagError,
    generation::{GenerationParams, Generator, build_generator},
    index::{EntryMetadata, IndexEntry, Metric, SearchFilter, VectorIndex},
    metadata::{
        ChunkRecord, Document, DocumentFilter, LocalMetadataStore, MetadataStore, QueryLog,
        RetrievedChunk, now_rfc3339,
    },
    metrics::{MetricsSnapshot, PipelineMetrics},
    rerank::{RerankCandidate, Reranker, build_reranker, enforce_subset},
    storage::{SnapshotStamp, write_atomic},
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// File name of the vector snapshot inside the storage directory.
pub const INDEX_FILE: &str = "index.rvi";
/// Last index snapshot known to match the document store. Present only while a persist is in
/// flight or after one failed part way.
pub const PREVIOUS_INDEX_FILE: &str = "index.rvi.prev";

/// Capabilities and shared state the pipeline runs against.
///
/// Everything the pipeline touches is owned here and handed over explicitly; there are no
/// process-wide singletons. The index and store are shared through `Arc` and only mutated via
/// their own APIs.
pub struct RagContext {
    /// Validated pipeline knobs.
    pub pipeline: PipelineConfig,
    /// Text embedder; its dimension must match the index.
    pub embedder: Arc<dyn Embedder>,
    /// Answer generator.
    pub generator: Arc<dyn Generator>,
    /// Optional second-stage reranker.
    pub reranker: Arc<dyn Reranker>,
    /// Vector index.
    pub index: Arc<VectorIndex>,
    /// Document, chunk and query-log store.
    pub store: Arc<dyn MetadataStore>,
    /// Directory holding the snapshots; `None` keeps everything in memory.
    pub storage_dir: Option<PathBuf>,
    // Loaded from the previous index snapshot; the current one on disk is ahead of the store.
    recovered: bool,
}

impl RagContext {
    /// Context with an empty in-memory index and store.
    pub fn in_memory(
        pipeline: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        reranker: Arc<dyn Reranker>,
    ) -> Result<Self, RagError> {
        let index = VectorIndex::new(embedder.dimension(), Metric::Cosine)?;
        Ok(Self {
            pipeline,
            embedder,
            generator,
            reranker,
            index: Arc::new(index),
            store: Arc::new(LocalMetadataStore::in_memory()),
            storage_dir: None,
            recovered: false,
        })
    }

    /// Build adapters from configuration and load persisted state from `storage_dir`.
    pub async fn from_config(config: &Config) -> Result<Self, RagError> {
        let embedder = build_embedder(config);
        let generator = build_generator(config);
        let reranker = build_reranker(config);
        let Some(dir) = config.storage_dir.clone() else {
            return Self::in_memory(config.pipeline.clone(), embedder, generator, reranker);
        };
        let opened = open_storage(&dir, embedder.dimension()).await?;
        Ok(Self {
            pipeline: config.pipeline.clone(),
            embedder,
            generator,
            reranker,
            index: Arc::new(opened.index),
            store: Arc::new(opened.store),
            storage_dir: Some(dir),
            recovered: opened.recovered,
        })
    }
}

struct OpenedStorage {
    index: VectorIndex,
    store: LocalMetadataStore,
    recovered: bool,
}

/// Load the index and document store together, refusing inconsistent pairs.
///
/// When the current index snapshot is ahead of the store because a persist stopped between the
/// two writes, the previous index snapshot is used instead if it matches the store.
async fn open_storage(dir: &Path, dimension: usize) -> Result<OpenedStorage, RagError> {
    let index_path = dir.join(INDEX_FILE);
    let index_exists = path_exists(&index_path).await?;
    let store_exists = LocalMetadataStore::snapshot_exists(dir).await;
    let store = LocalMetadataStore::open(dir).await?;

    let loaded = match (index_exists, store_exists) {
        (false, false) => {
            tracing::info!(dir = %dir.display(), "No snapshot found; starting with an empty index");
            return Ok(OpenedStorage {
                index: VectorIndex::new(dimension, Metric::Cosine)?,
                store,
                recovered: false,
            });
        }
        (true, true) => {
            let index = VectorIndex::load(&index_path, dimension, Metric::Cosine).await?;
            let index_stamp = index.stamp().await;
            let store_stamp = store.stamp().await;
            if store_stamp == Some(index_stamp) {
                Ok(index)
            } else {
                Err(format!(
                    "snapshot stamps disagree: index {index_stamp:?}, store {store_stamp:?}"
                ))
            }
        }
        (true, false) => Err("index snapshot present without its document store".to_string()),
        (false, true) => {
            return Err(RagError::IndexCorruption(
                "document store present without its index snapshot".into(),
            ));
        }
    };

    let (index, recovered) = match loaded {
        Ok(index) => (index, false),
        Err(reason) => match load_previous_index(dir, dimension, &store, store_exists).await? {
            Some(index) => {
                tracing::warn!(
                    dir = %dir.display(),
                    reason = %reason,
                    "Current index snapshot is ahead of the document store; using the previous one"
                );
                (index, true)
            }
            None => return Err(RagError::IndexCorruption(reason)),
        },
    };

    let chunks = store.counts().await.chunks;
    let vectors = index.len().await;
    if chunks != vectors {
        return Err(RagError::IndexCorruption(format!(
            "document store lists {chunks} chunks but the index holds {vectors} vectors"
        )));
    }
    Ok(OpenedStorage {
        index,
        store,
        recovered,
    })
}

/// The previous index snapshot, when it is readable and belongs with `store`.
///
/// A missing store only pairs with an empty previous snapshot, the state before the first
/// complete persist.
async fn load_previous_index(
    dir: &Path,
    dimension: usize,
    store: &LocalMetadataStore,
    store_exists: bool,
) -> Result<Option<VectorIndex>, RagError> {
    let path = dir.join(PREVIOUS_INDEX_FILE);
    if !path_exists(&path).await? {
        return Ok(None);
    }
    let index = match VectorIndex::load(&path, dimension, Metric::Cosine).await {
        Ok(index) => index,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "Previous index snapshot unusable"
            );
            return Ok(None);
        }
    };
    let matches = if store_exists {
        store.stamp().await == Some(index.stamp().await)
    } else {
        index.is_empty().await
    };
    Ok(matches.then_some(index))
}

async fn path_exists(path: &Path) -> Result<bool, RagError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|error| RagError::Storage(error.to_string()))
}

/// Coordinates ingestion and query workflows.
///
/// Construct once near process start and share through an `Arc`; every operation takes `&self`.
pub struct RagPipeline {
    ctx: RagContext,
    chunker: Chunker,
    dedup: Deduplicator,
    permits: Semaphore,
    // Writers hold it shared; persistence holds it exclusively so both files see the same state.
    commit_gate: RwLock<()>,
    // The index and store files on disk carry the same stamp.
    disk_consistent: AtomicBool,
    metrics: PipelineMetrics,
}

/// Abstraction over the pipeline used by external surfaces (HTTP, CLI).
#[async_trait]
pub trait RagApi: Send + Sync {
    /// Ingest one document.
    async fn ingest(&self, document: NewDocument) -> Result<IngestOutcome, RagError>;

    /// Ingest several documents, isolating failures.
    async fn ingest_batch(&self, documents: Vec<NewDocument>) -> BatchOutcome;

    /// Answer a question from indexed context.
    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, RagError>;

    /// Return the passages a query would be answered from.
    async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        category: Option<String>,
    ) -> Result<Vec<Source>, RagError>;

    /// Fetch a document by id.
    async fn document(&self, document_id: &str) -> Result<Document, RagError>;

    /// Delete a document and everything derived from it.
    async fn delete(&self, document_id: &str) -> Result<(), RagError>;

    /// List documents, newest first.
    async fn list_documents(&self, filter: DocumentFilter) -> Result<Vec<Document>, RagError>;

    /// Change category and/or tags of a document.
    async fn update_document(
        &self,
        document_id: &str,
        update: DocumentUpdate,
    ) -> Result<Document, RagError>;

    /// Most recent query logs, newest first.
    async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLog>, RagError>;

    /// Store and index counters.
    async fn stats(&self) -> Stats;

    /// Probe upstream services.
    async fn health(&self) -> Health;

    /// Ingest every matching file below a directory on the server's filesystem.
    async fn ingest_directory(
        &self,
        dir: PathBuf,
        options: DirectoryOptions,
    ) -> Result<BatchOutcome, RagError>;

    /// Delete every document and vector. Query logs are kept.
    async fn clear_index(&self) -> Result<ClearOutcome, RagError>;

    /// Write both snapshots.
    async fn persist(&self) -> Result<Option<SnapshotStamp>, RagError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

impl RagPipeline {
    /// Validate the context and build the pipeline.
    pub fn new(ctx: RagContext) -> Result<Self, RagError> {
        ctx.pipeline
            .validate()
            .map_err(|error| RagError::InvalidConfig(error.to_string()))?;
        if ctx.index.dimension() != ctx.embedder.dimension() {
            return Err(RagError::InvalidConfig(format!(
                "embedder dimension {} does not match index dimension {}",
                ctx.embedder.dimension(),
                ctx.index.dimension()
            )));
        }
        let chunker = Chunker::new(ctx.pipeline.chunk_size, ctx.pipeline.chunk_overlap)?;
        let permits = Semaphore::new(ctx.pipeline.max_concurrency);
        let disk_consistent = AtomicBool::new(!ctx.recovered);
        tracing::info!(
            dimension = ctx.index.dimension(),
            chunk_size = chunker.chunk_size(),
            overlap = chunker.overlap(),
            reranker = ctx.reranker.is_enabled(),
            storage_dir = ?ctx.storage_dir,
            "RAG pipeline ready"
        );
        Ok(Self {
            ctx,
            chunker,
            dedup: Deduplicator::new(),
            permits,
            commit_gate: RwLock::new(()),
            disk_consistent,
            metrics: PipelineMetrics::new(),
        })
    }

    /// Build the context from configuration, load persisted state and build the pipeline.
    ///
    /// Fails with [`RagError::IndexCorruption`] when the snapshots on disk are unreadable or
    /// inconsistent; corrupted state is never silently replaced with an empty index.
    pub async fn open(config: &Config) -> Result<Self, RagError> {
        Self::new(RagContext::from_config(config).await?)
    }

    /// Shared state and capabilities.
    pub fn context(&self) -> &RagContext {
        &self.ctx
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.ctx.pipeline.upstream_timeout,
            max_retries: self.ctx.pipeline.max_retries,
        }
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, RagError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| RagError::Cancelled)
    }

    /// Chunk, embed and index a document. Identical content is reported as a duplicate.
    ///
    /// Once the document is committed the call succeeds; a failed automatic persist is logged
    /// and counted in [`MetricsSnapshot::persist_failures`].
    pub async fn ingest(&self, document: NewDocument) -> Result<IngestOutcome, RagError> {
        let outcome = {
            let _permit = self.acquire().await?;
            self.ingest_one(document, &CancellationToken::new()).await?
        };
        if outcome.status == IngestStatus::Created {
            self.autosave().await;
        }
        Ok(outcome)
    }

    async fn ingest_one(
        &self,
        document: NewDocument,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, RagError> {
        let NewDocument {
            content,
            source,
            category,
            tags,
            notes,
        } = document;
        if content.trim().is_empty() {
            return Err(RagError::Validation("document content is empty".into()));
        }

        let digest = content_digest(content.as_bytes());
        let _digest_guard = self.dedup.lock(&digest).await;
        if let Some(existing) = self.ctx.store.get_by_hash(&digest).await? {
            self.metrics.record_duplicate();
            tracing::info!(
                document_id = %existing.id,
                source = ?source,
                "Duplicate content; skipping ingestion"
            );
            return Ok(IngestOutcome {
                document_id: existing.id,
                status: IngestStatus::Duplicate,
                chunk_count: existing.chunk_count,
            });
        }

        let chunks = self.chunker.split(&content);
        let document_id = Uuid::new_v4().to_string();
        let category = sanitize_category(category);
        tracing::debug!(
            document_id = %document_id,
            chunks = chunks.len(),
            bytes = content.len(),
            "Document chunked"
        );

        let mut entries = Vec::with_capacity(chunks.len());
        let mut records = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = with_retry(self.retry_policy(), QueryStage::Embedding, cancel, || {
                self.ctx.embedder.embed(&chunk.text)
            })
            .await?;
            let chunk_id = format!("{document_id}#{}", chunk.ordinal);
            entries.push(IndexEntry {
                chunk_id: chunk_id.clone(),
                vector,
                metadata: EntryMetadata {
                    document_id: document_id.clone(),
                    category: category.clone(),
                },
            });
            records.push(ChunkRecord {
                id: chunk_id,
                document_id: document_id.clone(),
                ordinal: chunk.ordinal,
                text: chunk.text,
                token_count: chunk.token_count,
                byte_start: chunk.byte_start,
                byte_end: chunk.byte_end,
            });
        }

        let chunk_count = records.len();
        let record = Document {
            id: document_id.clone(),
            content_hash: digest,
            source: sanitize_string(source),
            category,
            tags: sanitize_tags(tags),
            notes: sanitize_string(notes),
            size_bytes: content.len() as u64,
            created_at: now_rfc3339(),
            chunk_count,
        };

        let _commit = self.commit_gate.read().await;
        let chunk_ids: Vec<String> = entries.iter().map(|entry| entry.chunk_id.clone()).collect();
        self.ctx.index.add(entries).await?;
        if let Err(error) = self.ctx.store.record_document(record, records).await {
            self.ctx.index.remove(&chunk_ids).await;
            tracing::warn!(
                document_id = %document_id,
                error = %error,
                "Metadata write failed; index entries rolled back"
            );
            return Err(error.into());
        }

        self.metrics.record_document(chunk_count as u64);
        tracing::info!(
            document_id = %document_id,
            chunks = chunk_count,
            "Document ingested"
        );
        Ok(IngestOutcome {
            document_id,
            status: IngestStatus::Created,
            chunk_count,
        })
    }

    /// Ingest documents concurrently, bounded by the worker pool. One failure does not affect
    /// the others; results keep submission order.
    pub async fn ingest_batch(&self, documents: Vec<NewDocument>) -> BatchOutcome {
        let cancel = CancellationToken::new();
        let results = join_all(
            documents
                .into_iter()
                .enumerate()
                .map(|(index, document)| self.ingest_batch_item(index, document, &cancel)),
        )
        .await;

        let mut outcome = BatchOutcome::default();
        for (index, source, result) in results {
            match result {
                Ok(ingested) => outcome.succeeded.push(ingested),
                Err(error) => {
                    tracing::warn!(index, source = ?source, error = %error, "Batch ingest failed");
                    outcome.failed.push(BatchFailure {
                        index,
                        source,
                        error,
                    });
                }
            }
        }

        let created = outcome
            .succeeded
            .iter()
            .any(|ingested| ingested.status == IngestStatus::Created);
        if created {
            self.autosave().await;
        }
        tracing::info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Batch ingest finished"
        );
        outcome
    }

    async fn ingest_batch_item(
        &self,
        index: usize,
        document: NewDocument,
        cancel: &CancellationToken,
    ) -> (usize, Option<String>, Result<IngestOutcome, RagError>) {
        let source = document.source.clone();
        let result = match self.acquire().await {
            Ok(_permit) => self.ingest_one(document, cancel).await,
            Err(error) => Err(error),
        };
        (index, source, result)
    }

    /// Ingest every matching file below `dir`.
    pub async fn ingest_directory(
        &self,
        dir: &Path,
        options: &DirectoryOptions,
    ) -> Result<BatchOutcome, RagError> {
        if !dir.is_dir() {
            return Err(RagError::NotFound(format!(
                "directory {} does not exist",
                dir.display()
            )));
        }
        let extensions: HashSet<String> = options
            .extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect();
        let max_depth = if options.recursive { usize::MAX } else { 1 };
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!(error = %error, "Skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| extensions.contains(&ext.to_lowercase()))
            })
            .collect();
        paths.sort();
        tracing::info!(dir = %dir.display(), files = paths.len(), "Ingesting directory");

        let mut documents = Vec::with_capacity(paths.len());
        let mut read_failures = Vec::new();
        for path in paths {
            let source = path.display().to_string();
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => documents.push(NewDocument {
                    content,
                    source: Some(source),
                    category: options.category.clone(),
                    tags: options.tags.clone(),
                    notes: None,
                }),
                Err(error) => read_failures.push((source, error)),
            }
        }

        let mut outcome = self.ingest_batch(documents).await;
        let offset = outcome.succeeded.len() + outcome.failed.len();
        for (position, (source, error)) in read_failures.into_iter().enumerate() {
            tracing::warn!(source = %source, error = %error, "Failed to read file");
            outcome.failed.push(BatchFailure {
                index: offset + position,
                source: Some(source),
                error: RagError::Storage(error.to_string()),
            });
        }
        Ok(outcome)
    }

    /// Answer a question from indexed context.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, RagError> {
        self.query_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`RagPipeline::query`], abandoning the in-flight upstream call when `cancel` fires.
    pub async fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryResponse, RagError> {
        let top_k = self.validate_query(&request.query, request.top_k)?;
        let _permit = self.acquire().await?;
        let mut run = QueryRun::start();
        let query_id = Uuid::new_v4().to_string();

        match self.run_query(&request, top_k, &mut run, &cancel).await {
            Ok((answer, passages, no_context)) => {
                let latency_ms = run.elapsed_ms();
                self.metrics.record_query(latency_ms, no_context);
                let log = QueryLog {
                    id: query_id.clone(),
                    query_text: request.query.clone(),
                    retrieved: passages
                        .iter()
                        .map(|passage| RetrievedChunk {
                            chunk_id: passage.chunk_id.clone(),
                            score: passage.score,
                        })
                        .collect(),
                    answer: Some(answer.clone()),
                    no_context,
                    error: None,
                    failed_stage: None,
                    timestamp: now_rfc3339(),
                    latency_ms,
                };
                self.log_query(log).await;
                tracing::info!(
                    query_id = %query_id,
                    sources = passages.len(),
                    no_context,
                    latency_ms,
                    "Query completed"
                );

                let sources = if request.return_sources {
                    passages
                        .into_iter()
                        .map(|passage| self.to_source(passage))
                        .collect()
                } else {
                    Vec::new()
                };
                Ok(QueryResponse {
                    query_id,
                    answer,
                    sources,
                    no_context,
                    latency_ms,
                })
            }
            Err(error) => {
                let stage = run.fail();
                let latency_ms = run.elapsed_ms();
                self.metrics.record_query_failure();
                if matches!(error, RagError::Cancelled) {
                    tracing::info!(query_id = %query_id, %stage, "Query cancelled");
                } else {
                    tracing::error!(
                        query_id = %query_id,
                        %stage,
                        kind = error.kind(),
                        error = %error,
                        "Query failed"
                    );
                }
                self.log_query(QueryLog {
                    id: query_id,
                    query_text: request.query,
                    retrieved: Vec::new(),
                    answer: None,
                    no_context: false,
                    error: Some(error.to_string()),
                    failed_stage: Some(stage),
                    timestamp: now_rfc3339(),
                    latency_ms,
                })
                .await;
                Err(error)
            }
        }
    }

    async fn run_query(
        &self,
        request: &QueryRequest,
        top_k: usize,
        run: &mut QueryRun,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ContextPassage>, bool), RagError> {
        let query = request.query.trim();
        let mut passages = self
            .retrieve_passages(query, top_k, request.category.clone(), run, cancel)
            .await?;

        let threshold = self.ctx.pipeline.similarity_threshold;
        let rerank = self.ctx.pipeline.reranker_enabled && self.ctx.reranker.is_enabled();
        let filter_after_rerank =
            rerank && self.ctx.pipeline.threshold_stage == ThresholdStage::AfterRerank;
        if !filter_after_rerank {
            passages.retain(|passage| passage.score >= threshold);
        }

        if rerank && !passages.is_empty() {
            run.advance(QueryStage::Reranking)?;
            passages = self.rerank(query, passages, top_k, cancel).await?;
            if filter_after_rerank {
                passages.retain(|passage| passage.score >= threshold);
            }
        }
        sort_passages(&mut passages);

        if passages.is_empty() {
            run.advance(QueryStage::Completed)?;
            tracing::debug!(threshold, "No passage cleared the similarity threshold");
            return Ok((NO_CONTEXT_ANSWER.to_string(), passages, true));
        }

        run.advance(QueryStage::PromptBuilding)?;
        let prompt = build_prompt(query, &passages);

        run.advance(QueryStage::Generating)?;
        let params = GenerationParams::default();
        let answer = with_retry(self.retry_policy(), QueryStage::Generating, cancel, || {
            self.ctx.generator.generate(&prompt, &params)
        })
        .await?;
        run.advance(QueryStage::Completed)?;
        Ok((answer.trim().to_string(), passages, false))
    }

    async fn retrieve_passages(
        &self,
        query: &str,
        top_k: usize,
        category: Option<String>,
        run: &mut QueryRun,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContextPassage>, RagError> {
        let vector = with_retry(self.retry_policy(), QueryStage::Embedding, cancel, || {
            self.ctx.embedder.embed(query)
        })
        .await?;

        run.advance(QueryStage::Retrieving)?;
        let filter = SearchFilter {
            category: category.map(|category| category.trim().to_lowercase()),
            document_id: None,
        };
        let hits = self
            .ctx
            .index
            .search_filtered(&vector, top_k, &filter)
            .await?;
        let ids: Vec<String> = hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        let mut texts: HashMap<String, String> = self
            .ctx
            .store
            .chunks(&ids)
            .await?
            .into_iter()
            .map(|chunk| (chunk.id, chunk.text))
            .collect();

        let mut passages = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(text) = texts.remove(&hit.chunk_id) else {
                tracing::warn!(chunk_id = %hit.chunk_id, "Indexed chunk missing from store; skipping");
                continue;
            };
            passages.push(ContextPassage {
                chunk_id: hit.chunk_id,
                document_id: hit.metadata.document_id,
                category: hit.metadata.category,
                text,
                score: hit.score,
            });
        }
        tracing::debug!(top_k, candidates = passages.len(), "Retrieved candidates");
        Ok(passages)
    }

    async fn rerank(
        &self,
        query: &str,
        passages: Vec<ContextPassage>,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContextPassage>, RagError> {
        let top_n = self.ctx.pipeline.rerank_top_n.min(top_k);
        let candidates: Vec<RerankCandidate> = passages
            .iter()
            .map(|passage| RerankCandidate {
                chunk_id: passage.chunk_id.clone(),
                text: passage.text.clone(),
                score: passage.score,
            })
            .collect();
        let input_ids: HashSet<String> = candidates
            .iter()
            .map(|candidate| candidate.chunk_id.clone())
            .collect();

        let output = with_retry(self.retry_policy(), QueryStage::Reranking, cancel, || {
            self.ctx.reranker.rerank(query, candidates.clone(), top_n)
        })
        .await?;
        let output = enforce_subset(&input_ids, output, top_n);

        let mut by_id: HashMap<String, ContextPassage> = passages
            .into_iter()
            .map(|passage| (passage.chunk_id.clone(), passage))
            .collect();
        let reranked: Vec<ContextPassage> = output
            .into_iter()
            .filter_map(|candidate| {
                by_id.remove(&candidate.chunk_id).map(|mut passage| {
                    passage.score = candidate.score;
                    passage
                })
            })
            .collect();
        tracing::debug!(
            candidates = input_ids.len(),
            kept = reranked.len(),
            "Reranked candidates"
        );
        Ok(reranked)
    }

    /// Passages a query would be answered from, without generation or reranking.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        category: Option<String>,
    ) -> Result<Vec<Source>, RagError> {
        let top_k = self.validate_query(query, top_k)?;
        let _permit = self.acquire().await?;
        let mut run = QueryRun::start();
        let cancel = CancellationToken::new();
        let mut passages = match self
            .retrieve_passages(query.trim(), top_k, category, &mut run, &cancel)
            .await
        {
            Ok(passages) => passages,
            Err(error) => {
                let stage = run.fail();
                tracing::warn!(%stage, error = %error, "Retrieval failed");
                return Err(error);
            }
        };
        let threshold = self.ctx.pipeline.similarity_threshold;
        passages.retain(|passage| passage.score >= threshold);
        sort_passages(&mut passages);
        run.advance(QueryStage::Completed)?;
        Ok(passages
            .into_iter()
            .map(|passage| self.to_source(passage))
            .collect())
    }

    fn validate_query(&self, query: &str, top_k: Option<usize>) -> Result<usize, RagError> {
        if query.trim().is_empty() {
            return Err(RagError::Validation("query must not be empty".into()));
        }
        let top_k = top_k.unwrap_or(self.ctx.pipeline.top_k);
        let max = self.ctx.pipeline.max_top_k;
        if top_k == 0 || top_k > max {
            return Err(RagError::Validation(format!(
                "top_k must be within 1..={max}, got {top_k}"
            )));
        }
        Ok(top_k)
    }

    fn to_source(&self, passage: ContextPassage) -> Source {
        Source {
            chunk_id: passage.chunk_id,
            document_id: passage.document_id,
            category: passage.category,
            score: passage.score,
            text: preview(passage.text, self.ctx.pipeline.source_preview_chars),
        }
    }

    async fn log_query(&self, log: QueryLog) {
        if let Err(error) = self.ctx.store.record_query(log).await {
            tracing::warn!(error = %error, "Failed to record query log");
        }
    }

    /// Fetch a document by id.
    pub async fn document(&self, document_id: &str) -> Result<Document, RagError> {
        Ok(self.ctx.store.get(document_id).await?)
    }

    /// Delete a document, its chunks and its vectors.
    pub async fn delete(&self, document_id: &str) -> Result<(), RagError> {
        {
            let _commit = self.commit_gate.read().await;
            let (document, chunk_ids) = self
                .ctx
                .store
                .delete(document_id)
                .await?
                .ok_or_else(|| RagError::NotFound(format!("document '{document_id}'")))?;
            // Sweep by owner so vectors the store lost track of go too.
            let removed = self.ctx.index.remove_document(&document.id).await;
            if removed.len() != chunk_ids.len() {
                tracing::warn!(
                    document_id = %document.id,
                    chunks = chunk_ids.len(),
                    vectors = removed.len(),
                    "Index and document store disagreed on the document's chunks"
                );
            }
            tracing::info!(
                document_id = %document.id,
                chunks = chunk_ids.len(),
                vectors = removed.len(),
                "Document deleted"
            );
        }
        self.autosave().await;
        Ok(())
    }

    /// Delete every document and drop every vector. Query logs are kept.
    pub async fn clear_index(&self) -> Result<ClearOutcome, RagError> {
        let outcome = {
            let _exclusive = self.commit_gate.write().await;
            let documents = self.ctx.store.list(&DocumentFilter::default()).await?;
            if documents.is_empty() && self.ctx.index.is_empty().await {
                return Ok(ClearOutcome::default());
            }
            let mut documents_removed = 0;
            for document in documents {
                if self.ctx.store.delete(&document.id).await?.is_some() {
                    documents_removed += 1;
                }
            }
            ClearOutcome {
                documents_removed,
                vectors_removed: self.ctx.index.clear().await,
            }
        };
        tracing::info!(
            documents = outcome.documents_removed,
            vectors = outcome.vectors_removed,
            "Index cleared"
        );
        self.autosave().await;
        Ok(outcome)
    }

    /// Documents matching `filter`, newest first.
    pub async fn list_documents(&self, filter: DocumentFilter) -> Result<Vec<Document>, RagError> {
        Ok(self.ctx.store.list(&filter).await?)
    }

    /// Replace category and/or tags of a document; the index copy of the category follows.
    pub async fn update_document(
        &self,
        document_id: &str,
        update: DocumentUpdate,
    ) -> Result<Document, RagError> {
        let document = {
            let _commit = self.commit_gate.read().await;
            let category = update.category.map(|category| sanitize_category(Some(category)));
            let tags = update.tags.map(sanitize_tags);
            let document = self
                .ctx
                .store
                .update_metadata(document_id, category.clone(), tags)
                .await?;
            if let Some(category) = category {
                self.ctx
                    .index
                    .update_category(document_id, &category)
                    .await;
            }
            tracing::info!(document_id, category = %document.category, "Document metadata updated");
            document
        };
        self.autosave().await;
        Ok(document)
    }

    /// Most recent query logs, newest first.
    pub async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLog>, RagError> {
        Ok(self.ctx.store.recent_queries(limit).await?)
    }

    /// Store and index counters.
    pub async fn stats(&self) -> Stats {
        let counts = self.ctx.store.counts().await;
        Stats {
            document_count: counts.documents,
            chunk_count: counts.chunks,
            index_size: self.ctx.index.len().await,
            query_count: counts.queries,
            dimension: self.ctx.index.dimension(),
        }
    }

    /// Probe the generator and report index size.
    pub async fn health(&self) -> Health {
        let probe = self.ctx.generator.health_check().await;
        if let Err(error) = &probe {
            tracing::warn!(error = %error, "Generator health probe failed");
        }
        Health {
            status: if probe.is_ok() { "ok" } else { "degraded" },
            generator_reachable: probe.is_ok(),
            generator_error: probe.err().map(|error| error.to_string()),
            reranker_enabled: self.ctx.pipeline.reranker_enabled && self.ctx.reranker.is_enabled(),
            index_size: self.ctx.index.len().await,
            timestamp: now_rfc3339(),
        }
    }

    /// Write the index snapshot and the document store under one generation stamp.
    ///
    /// The index file that matches the store on disk is kept as [`PREVIOUS_INDEX_FILE`] until
    /// both writes land, so a failure between them leaves a pair [`RagPipeline::open`] can load.
    /// Returns `None` for in-memory pipelines.
    pub async fn persist(&self) -> Result<Option<SnapshotStamp>, RagError> {
        let Some(dir) = &self.ctx.storage_dir else {
            return Ok(None);
        };
        let _exclusive = self.commit_gate.write().await;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|error| RagError::Storage(error.to_string()))?;
        let index_path = dir.join(INDEX_FILE);
        let previous_path = dir.join(PREVIOUS_INDEX_FILE);
        if self.disk_consistent.load(Ordering::Acquire) {
            self.keep_previous_index(&index_path, &previous_path).await?;
            self.disk_consistent.store(false, Ordering::Release);
        }

        let stamp = self.ctx.index.persist(&index_path).await?;
        self.ctx.store.flush(stamp).await?;
        self.disk_consistent.store(true, Ordering::Release);

        match tokio::fs::remove_file(&previous_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(
                    path = %previous_path.display(),
                    error = %error,
                    "Failed to remove previous index snapshot"
                );
            }
        }
        tracing::debug!(generation = stamp.generation, "Snapshots persisted");
        Ok(Some(stamp))
    }

    /// Copy the consistent index file aside. Before the first persist there is none, and an
    /// empty snapshot stands in for the empty store.
    async fn keep_previous_index(&self, current: &Path, previous: &Path) -> Result<(), RagError> {
        match tokio::fs::read(current).await {
            Ok(bytes) => write_atomic(previous, &bytes)
                .await
                .map_err(|error| RagError::Storage(error.to_string())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let empty = VectorIndex::new(self.ctx.index.dimension(), self.ctx.index.metric())?;
                empty.persist(previous).await?;
                Ok(())
            }
            Err(error) => Err(RagError::Storage(error.to_string())),
        }
    }

    // The mutation is already committed in memory; a failed write is retried by the next persist.
    async fn autosave(&self) {
        if !self.ctx.pipeline.autosave {
            return;
        }
        if let Err(error) = self.persist().await {
            self.metrics.record_persist_failure();
            tracing::error!(error = %error, "Automatic persist failed; changes are held in memory");
        }
    }

    /// Return the current pipeline metrics snapshot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn sort_passages(passages: &mut [ContextPassage]) {
    passages.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

fn preview(text: String, limit: Option<usize>) -> String {
    match limit {
        Some(limit) if text.chars().count() > limit => {
            let mut truncated: String = text.chars().take(limit).collect();
            truncated.push_str("...");
            truncated
        }
        _ => text,
    }
}

#[async_trait]
impl RagApi for RagPipeline {
    async fn ingest(&self, document: NewDocument) -> Result<IngestOutcome, RagError> {
        RagPipeline::ingest(self, document).await
    }

    async fn ingest_batch(&self, documents: Vec<NewDocument>) -> BatchOutcome {
        RagPipeline::ingest_batch(self, documents).await
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, RagError> {
        RagPipeline::query(self, request).await
    }

    async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        category: Option<String>,
    ) -> Result<Vec<Source>, RagError> {
        RagPipeline::retrieve(self, query, top_k, category).await
    }

    async fn document(&self, document_id: &str) -> Result<Document, RagError> {
        RagPipeline::document(self, document_id).await
    }

    async fn delete(&self, document_id: &str) -> Result<(), RagError> {
        RagPipeline::delete(self, document_id).await
    }

    async fn list_documents(&self, filter: DocumentFilter) -> Result<Vec<Document>, RagError> {
        RagPipeline::list_documents(self, filter).await
    }

    async fn update_document(
        &self,
        document_id: &str,
        update: DocumentUpdate,
    ) -> Result<Document, RagError> {
        RagPipeline::update_document(self, document_id, update).await
    }

    async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLog>, RagError> {
        RagPipeline::recent_queries(self, limit).await
    }

    async fn stats(&self) -> Stats {
        RagPipeline::stats(self).await
    }

    async fn health(&self) -> Health {
        RagPipeline::health(self).await
    }

    async fn ingest_directory(
        &self,
        dir: PathBuf,
        options: DirectoryOptions,
    ) -> Result<BatchOutcome, RagError> {
        RagPipeline::ingest_directory(self, &dir, &options).await
    }

    async fn clear_index(&self) -> Result<ClearOutcome, RagError> {
        RagPipeline::clear_index(self).await
    }

    async fn persist(&self) -> Result<Option<SnapshotStamp>, RagError> {
        RagPipeline::persist(self).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        RagPipeline::metrics_snapshot(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, score: f32) -> ContextPassage {
        ContextPassage {
            chunk_id: id.into(),
            document_id: "doc".into(),
            category: "general".into(),
            text: String::new(),
            score,
        }
    }

    #[test]
    fn passages_sort_by_score_then_id() {
        let mut passages = vec![passage("b", 0.5), passage("c", 0.9), passage("a", 0.5)];
        sort_passages(&mut passages);
        let ids: Vec<_> = passages.iter().map(|p| p.chunk_id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("héllo wörld".into(), Some(5)), "héllo...");
        assert_eq!(preview("short".into(), Some(10)), "short");
        assert_eq!(preview("untouched".into(), None), "untouched");
    }
}
