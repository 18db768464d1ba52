use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and query activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_ingested: AtomicU64,
    duplicates_skipped: AtomicU64,
    chunks_indexed: AtomicU64,
    queries_served: AtomicU64,
    queries_without_context: AtomicU64,
    queries_failed: AtomicU64,
    last_query_latency_ms: AtomicU64,
    persist_failures: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly ingested document and the number of chunks produced for it.
    pub fn record_document(&self, chunk_count: u64) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record an ingestion that resolved to an existing document.
    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed query.
    pub fn record_query(&self, latency_ms: u64, no_context: bool) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
        if no_context {
            self.queries_without_context.fetch_add(1, Ordering::Relaxed);
        }
        self.last_query_latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    /// Record a query that ended in an error.
    pub fn record_query_failure(&self) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a background snapshot write that failed after its mutation was committed.
    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last = self.last_query_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
            queries_without_context: self.queries_without_context.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            last_query_latency_ms: (self.queries_served.load(Ordering::Relaxed) > 0).then_some(last),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents ingested since startup.
    pub documents_ingested: u64,
    /// Ingestions that resolved to an already indexed document.
    pub duplicates_skipped: u64,
    /// Chunks written to the index since startup.
    pub chunks_indexed: u64,
    /// Queries that completed, with or without context.
    pub queries_served: u64,
    /// Completed queries answered with the no-context response.
    pub queries_without_context: u64,
    /// Queries that ended in an error.
    pub queries_failed: u64,
    /// Automatic snapshot writes that failed; the in-memory state stays authoritative.
    pub persist_failures: u64,
    /// Latency of the most recent completed query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_query_latency_ms: Option<u64>,
}
