//! HTTP surface for Rusty RAG.
//!
//! The Axum router exposes the pipeline operations as JSON endpoints:
//!
//! - `POST /documents` – Ingest one document (`201` when created, `200` for duplicate content).
//! - `POST /documents/batch` – Ingest several documents; failures are reported per document.
//! - `POST /documents/directory` – Ingest matching files from a directory on the server host.
//! - `GET /documents` – List documents, newest first (`category`, `tag`, `limit` query params).
//! - `GET|PATCH|DELETE /documents/{id}` – Inspect, recategorize/retag, or delete a document.
//! - `POST /query` – Answer a question from indexed context.
//! - `POST /retrieve` – Return the passages a question would be answered from.
//! - `GET /queries` – Recent query logs.
//! - `GET /stats`, `GET /health`, `GET /metrics` – Counters and upstream reachability.
//! - `POST /persist` – Flush the index snapshot and document store.
//! - `POST /admin/clear-index` – Delete every document and vector; query logs stay.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.
//!
//! Errors are returned as `{ "error": kind, "message": text }` with a status derived from the
//! error kind.

use crate::error::RagError;
use crate::metadata::DocumentFilter;
use crate::pipeline::{
    BatchOutcome, ClearOutcome, DirectoryOptions, DocumentUpdate, NewDocument, QueryRequest,
    RagApi,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Build the HTTP router exposing the pipeline.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: RagApi + 'static,
{
    Router::new()
        .route(
            "/documents",
            get(list_documents::<S>).post(ingest_document::<S>),
        )
        .route("/documents/batch", post(ingest_batch::<S>))
        .route("/documents/directory", post(ingest_directory::<S>))
        .route(
            "/documents/:id",
            get(get_document::<S>)
                .patch(update_document::<S>)
                .delete(delete_document::<S>),
        )
        .route("/query", post(query::<S>))
        .route("/retrieve", post(retrieve::<S>))
        .route("/queries", get(recent_queries::<S>))
        .route("/stats", get(stats::<S>))
        .route("/health", get(health::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/persist", post(persist::<S>))
        .route("/admin/clear-index", post(clear_index::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

/// Ingest a single document.
async fn ingest_document<S>(
    State(service): State<Arc<S>>,
    Json(document): Json<NewDocument>,
) -> Result<Response, AppError>
where
    S: RagApi,
{
    let outcome = service.ingest(document).await?;
    let status = match outcome.status {
        crate::pipeline::IngestStatus::Created => StatusCode::CREATED,
        crate::pipeline::IngestStatus::Duplicate => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

/// Request body for `POST /documents/batch`.
#[derive(Deserialize)]
struct BatchRequest {
    documents: Vec<NewDocument>,
}

#[derive(Serialize)]
struct BatchFailureBody {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    error: &'static str,
    message: String,
}

/// Ingest several documents, isolating per-document failures.
async fn ingest_batch<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<BatchRequest>,
) -> Json<serde_json::Value>
where
    S: RagApi,
{
    batch_body(service.ingest_batch(request.documents).await)
}

/// Request body for `POST /documents/directory`.
#[derive(Deserialize)]
struct DirectoryRequest {
    path: PathBuf,
    #[serde(flatten)]
    options: DirectoryOptions,
}

/// Ingest files from a directory readable by the server process.
async fn ingest_directory<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<DirectoryRequest>,
) -> Result<Json<serde_json::Value>, AppError>
where
    S: RagApi,
{
    let outcome = service
        .ingest_directory(request.path, request.options)
        .await?;
    Ok(batch_body(outcome))
}

fn batch_body(outcome: BatchOutcome) -> Json<serde_json::Value> {
    let failed: Vec<BatchFailureBody> = outcome
        .failed
        .into_iter()
        .map(|failure| BatchFailureBody {
            index: failure.index,
            source: failure.source,
            error: failure.error.kind(),
            message: failure.error.to_string(),
        })
        .collect();
    Json(json!({
        "succeeded": outcome.succeeded,
        "failed": failed,
    }))
}

/// Query parameters for `GET /documents`.
#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_documents<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError>
where
    S: RagApi,
{
    let documents = service
        .list_documents(DocumentFilter {
            category: params.category,
            tag: params.tag,
            limit: params.limit,
        })
        .await?;
    Ok(Json(json!({ "documents": documents })))
}

async fn get_document<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<crate::metadata::Document>, AppError>
where
    S: RagApi,
{
    Ok(Json(service.document(&id).await?))
}

async fn update_document<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
    Json(update): Json<DocumentUpdate>,
) -> Result<Json<crate::metadata::Document>, AppError>
where
    S: RagApi,
{
    Ok(Json(service.update_document(&id, update).await?))
}

async fn delete_document<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError>
where
    S: RagApi,
{
    service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Answer a question. Dropping the connection aborts the in-flight upstream call.
async fn query<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<crate::pipeline::QueryResponse>, AppError>
where
    S: RagApi,
{
    Ok(Json(service.query(request).await?))
}

/// Request body for `POST /retrieve`.
#[derive(Deserialize)]
struct RetrieveRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    category: Option<String>,
}

async fn retrieve<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<serde_json::Value>, AppError>
where
    S: RagApi,
{
    let sources = service
        .retrieve(&request.query, request.top_k, request.category)
        .await?;
    Ok(Json(json!({ "sources": sources })))
}

#[derive(Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    20
}

async fn recent_queries<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<RecentParams>,
) -> Result<Json<serde_json::Value>, AppError>
where
    S: RagApi,
{
    let queries = service.recent_queries(params.limit).await?;
    Ok(Json(json!({ "queries": queries })))
}

async fn stats<S>(State(service): State<Arc<S>>) -> Json<crate::pipeline::Stats>
where
    S: RagApi,
{
    Json(service.stats().await)
}

async fn health<S>(State(service): State<Arc<S>>) -> Json<crate::pipeline::Health>
where
    S: RagApi,
{
    Json(service.health().await)
}

/// Return pipeline counters and the latency of the last query.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<crate::metrics::MetricsSnapshot>
where
    S: RagApi,
{
    Json(service.metrics_snapshot())
}

async fn persist<S>(State(service): State<Arc<S>>) -> Result<Json<serde_json::Value>, AppError>
where
    S: RagApi,
{
    let stamp = service.persist().await?;
    Ok(Json(json!({
        "persisted": stamp.is_some(),
        "generation": stamp.map(|stamp| stamp.generation),
    })))
}

async fn clear_index<S>(State(service): State<Arc<S>>) -> Result<Json<ClearOutcome>, AppError>
where
    S: RagApi,
{
    Ok(Json(service.clear_index().await?))
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "ingest",
                method: "POST",
                path: "/documents",
                description: "Chunk, embed and index a document. Identical content returns the existing document with status \"duplicate\".",
                request_example: Some(json!({
                    "content": "Document contents",
                    "source": "notes/sqli.md",
                    "category": "web",
                    "tags": ["sqli", "injection"],
                    "notes": "optional free-form notes"
                })),
            },
            CommandDescriptor {
                name: "ingest_batch",
                method: "POST",
                path: "/documents/batch",
                description: "Ingest several documents; failures are reported per document.",
                request_example: Some(json!({
                    "documents": [{ "content": "First" }, { "content": "Second" }]
                })),
            },
            CommandDescriptor {
                name: "ingest_directory",
                method: "POST",
                path: "/documents/directory",
                description: "Ingest .txt/.md files (or the given extensions) below a directory on the server host.",
                request_example: Some(json!({
                    "path": "/srv/corpus",
                    "recursive": true,
                    "extensions": ["txt", "md"],
                    "category": "web",
                    "tags": ["imported"]
                })),
            },
            CommandDescriptor {
                name: "list_documents",
                method: "GET",
                path: "/documents",
                description: "List documents newest first, filtered by category or tag.",
                request_example: None,
            },
            CommandDescriptor {
                name: "query",
                method: "POST",
                path: "/query",
                description: "Answer a question from indexed context. Returns { answer, sources, no_context, latency_ms }.",
                request_example: Some(json!({
                    "query": "What is SQL injection?",
                    "top_k": 5,
                    "return_sources": true
                })),
            },
            CommandDescriptor {
                name: "retrieve",
                method: "POST",
                path: "/retrieve",
                description: "Return the passages a question would be answered from, without generation.",
                request_example: Some(json!({ "query": "What is SQL injection?", "top_k": 5 })),
            },
            CommandDescriptor {
                name: "delete_document",
                method: "DELETE",
                path: "/documents/{id}",
                description: "Delete a document together with its chunks and vectors.",
                request_example: None,
            },
            CommandDescriptor {
                name: "stats",
                method: "GET",
                path: "/stats",
                description: "Document, chunk, vector and query counts.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return pipeline counters useful for observability dashboards.",
                request_example: None,
            },
            CommandDescriptor {
                name: "clear_index",
                method: "POST",
                path: "/admin/clear-index",
                description: "Delete every document, chunk and vector. Query logs are kept.",
                request_example: None,
            },
        ],
    })
}

struct AppError(RagError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            RagError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RagError::IndexCorruption(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            RagError::InvalidConfig(_) | RagError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "Request failed");
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(inner: RagError) -> Self {
        Self(inner)
    }
}
