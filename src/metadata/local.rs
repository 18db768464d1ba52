//! File-backed metadata store.
//!
//! Documents and chunks are held in memory and written to `documents.rds` on flush. The file uses
//! the shared snapshot envelope:
//!
//! ```text
//! "RRDS" | version: u16 | dimension: u32 | generation: u64 | documents: u64
//! documents × ( document: json bytes | chunks: u32 | chunks × chunk: json bytes )
//! sha256(all of the above)
//! ```
//!
//! Query logs are appended to `queries.jsonl` as they are recorded. Only the newest
//! [`RECENT_QUERY_CAPACITY`] entries are kept in memory; the file keeps the full history.

use super::{
    ChunkRecord, Document, DocumentFilter, MetadataError, MetadataStore, QueryLog, StoreCounts,
};
use crate::storage::{RecordReader, RecordWriter, SnapshotStamp, write_atomic};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"RRDS";
const FORMAT_VERSION: u16 = 1;

/// File name of the document snapshot inside the storage directory.
pub const DOCUMENTS_FILE: &str = "documents.rds";
/// File name of the query log inside the storage directory.
pub const QUERIES_FILE: &str = "queries.jsonl";
/// Query logs kept in memory to answer `recent_queries`.
pub const RECENT_QUERY_CAPACITY: usize = 1000;

/// Metadata store kept in memory and optionally mirrored to a storage directory.
pub struct LocalMetadataStore {
    dir: Option<PathBuf>,
    state: RwLock<StoreState>,
    queries: Mutex<QueryLogBuffer>,
}

/// Newest query logs plus the number ever recorded.
struct QueryLogBuffer {
    recent: VecDeque<QueryLog>,
    total: usize,
    capacity: usize,
}

impl QueryLogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity.min(64)),
            total: 0,
            capacity,
        }
    }

    fn push(&mut self, log: QueryLog) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(log);
    }
}

#[derive(Default)]
struct StoreState {
    documents: HashMap<String, Document>,
    order: Vec<String>,
    by_hash: HashMap<String, String>,
    chunks: HashMap<String, ChunkRecord>,
    document_chunks: HashMap<String, Vec<String>>,
    stamp: Option<SnapshotStamp>,
}

impl StoreState {
    fn insert(&mut self, document: Document, chunks: Vec<ChunkRecord>) {
        let chunk_ids = chunks.iter().map(|chunk| chunk.id.clone()).collect();
        for chunk in chunks {
            self.chunks.insert(chunk.id.clone(), chunk);
        }
        self.document_chunks.insert(document.id.clone(), chunk_ids);
        self.by_hash
            .insert(document.content_hash.clone(), document.id.clone());
        self.order.push(document.id.clone());
        self.documents.insert(document.id.clone(), document);
    }
}

impl LocalMetadataStore {
    /// Store without a backing directory; `flush` only records the stamp.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: RwLock::new(StoreState::default()),
            queries: Mutex::new(QueryLogBuffer::new(RECENT_QUERY_CAPACITY)),
        }
    }

    /// Open the store rooted at `dir`, loading any existing documents and query logs.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let documents_path = dir.join(DOCUMENTS_FILE);
        let state = match tokio::fs::read(&documents_path).await {
            Ok(bytes) => decode(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(error) => return Err(error.into()),
        };
        let queries = load_queries(&dir.join(QUERIES_FILE), RECENT_QUERY_CAPACITY).await?;
        info!(
            dir = %dir.display(),
            documents = state.documents.len(),
            chunks = state.chunks.len(),
            queries = queries.total,
            "Document store opened"
        );

        Ok(Self {
            dir: Some(dir),
            state: RwLock::new(state),
            queries: Mutex::new(queries),
        })
    }

    /// Whether a document snapshot exists in `dir`.
    pub async fn snapshot_exists(dir: &Path) -> bool {
        tokio::fs::try_exists(dir.join(DOCUMENTS_FILE))
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl MetadataStore for LocalMetadataStore {
    async fn record_document(
        &self,
        document: Document,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), MetadataError> {
        if chunks.len() != document.chunk_count {
            return Err(MetadataError::Corruption(format!(
                "document {} declares {} chunks but {} were supplied",
                document.id,
                document.chunk_count,
                chunks.len()
            )));
        }
        let mut state = self.state.write().await;
        debug!(document_id = %document.id, chunks = chunks.len(), "Recording document");
        state.insert(document, chunks);
        Ok(())
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Document>, MetadataError> {
        let state = self.state.read().await;
        Ok(state
            .by_hash
            .get(content_hash)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    async fn get(&self, document_id: &str) -> Result<Document, MetadataError> {
        self.state
            .read()
            .await
            .documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(document_id.to_string()))
    }

    async fn chunks(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>, MetadataError> {
        let state = self.state.read().await;
        Ok(chunk_ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect())
    }

    async fn chunks_for(&self, document_id: &str) -> Result<Vec<ChunkRecord>, MetadataError> {
        let state = self.state.read().await;
        let ids = state
            .document_chunks
            .get(document_id)
            .ok_or_else(|| MetadataError::NotFound(document_id.to_string()))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect())
    }

    async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>, MetadataError> {
        let state = self.state.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.documents.get(id))
            .filter(|document| {
                filter
                    .category
                    .as_ref()
                    .is_none_or(|category| *category == document.category)
            })
            .filter(|document| {
                filter
                    .tag
                    .as_ref()
                    .is_none_or(|tag| document.tags.iter().any(|candidate| candidate == tag))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_metadata(
        &self,
        document_id: &str,
        category: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Document, MetadataError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| MetadataError::NotFound(document_id.to_string()))?;
        if let Some(category) = category {
            document.category = category;
        }
        if let Some(tags) = tags {
            document.tags = tags;
        }
        Ok(document.clone())
    }

    async fn delete(
        &self,
        document_id: &str,
    ) -> Result<Option<(Document, Vec<String>)>, MetadataError> {
        let mut state = self.state.write().await;
        let Some(document) = state.documents.remove(document_id) else {
            return Ok(None);
        };
        state.order.retain(|id| id != document_id);
        state.by_hash.remove(&document.content_hash);
        let chunk_ids = state
            .document_chunks
            .remove(document_id)
            .unwrap_or_default();
        for chunk_id in &chunk_ids {
            state.chunks.remove(chunk_id);
        }
        Ok(Some((document, chunk_ids)))
    }

    async fn record_query(&self, log: QueryLog) -> Result<(), MetadataError> {
        let mut queries = self.queries.lock().await;
        if let Some(dir) = &self.dir {
            let mut line = serde_json::to_vec(&log)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(QUERIES_FILE))
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
        }
        queries.push(log);
        Ok(())
    }

    async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLog>, MetadataError> {
        let queries = self.queries.lock().await;
        Ok(queries.recent.iter().rev().take(limit).cloned().collect())
    }

    async fn counts(&self) -> StoreCounts {
        let state = self.state.read().await;
        let queries = self.queries.lock().await.total;
        StoreCounts {
            documents: state.documents.len(),
            chunks: state.chunks.len(),
            queries,
        }
    }

    async fn flush(&self, stamp: SnapshotStamp) -> Result<(), MetadataError> {
        let mut state = self.state.write().await;
        if let Some(dir) = &self.dir {
            let bytes = encode(&state, stamp)?;
            let path = dir.join(DOCUMENTS_FILE);
            write_atomic(&path, &bytes).await?;
            info!(
                path = %path.display(),
                documents = state.documents.len(),
                generation = stamp.generation,
                "Document store flushed"
            );
        }
        state.stamp = Some(stamp);
        Ok(())
    }

    async fn stamp(&self) -> Option<SnapshotStamp> {
        self.state.read().await.stamp
    }
}

fn encode(state: &StoreState, stamp: SnapshotStamp) -> Result<Vec<u8>, MetadataError> {
    let mut writer = RecordWriter::new(MAGIC, FORMAT_VERSION);
    writer.put_u32(stamp.dimension);
    writer.put_u64(stamp.generation);
    writer.put_u64(state.order.len() as u64);
    for id in &state.order {
        let Some(document) = state.documents.get(id) else {
            continue;
        };
        writer.put_bytes(&serde_json::to_vec(document)?);
        let chunk_ids = state
            .document_chunks
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        writer.put_len(chunk_ids.len());
        for chunk_id in chunk_ids {
            if let Some(chunk) = state.chunks.get(chunk_id) {
                writer.put_bytes(&serde_json::to_vec(chunk)?);
            }
        }
    }
    writer
        .finish()
        .map_err(|error| MetadataError::Encoding(error.to_string()))
}

fn decode(bytes: &[u8]) -> Result<StoreState, MetadataError> {
    let corruption = |error: crate::storage::CodecError| MetadataError::Corruption(error.to_string());
    let (mut reader, version) = RecordReader::open(bytes, MAGIC).map_err(corruption)?;
    if version != FORMAT_VERSION {
        return Err(MetadataError::Corruption(format!(
            "unsupported store version {version} (expected {FORMAT_VERSION})"
        )));
    }
    let dimension = reader.get_u32().map_err(corruption)?;
    let generation = reader.get_u64().map_err(corruption)?;
    let count = reader.get_u64().map_err(corruption)?;

    let mut state = StoreState {
        stamp: Some(SnapshotStamp {
            dimension,
            generation,
        }),
        ..StoreState::default()
    };
    for _ in 0..count {
        let document: Document = serde_json::from_slice(reader.get_bytes().map_err(corruption)?)
            .map_err(|error| MetadataError::Corruption(error.to_string()))?;
        let chunk_count = reader.get_u32().map_err(corruption)? as usize;
        if chunk_count != document.chunk_count {
            return Err(MetadataError::Corruption(format!(
                "document {} declares {} chunks but {} are stored",
                document.id, document.chunk_count, chunk_count
            )));
        }
        let mut chunks = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let chunk: ChunkRecord =
                serde_json::from_slice(reader.get_bytes().map_err(corruption)?)
                    .map_err(|error| MetadataError::Corruption(error.to_string()))?;
            if chunk.document_id != document.id {
                return Err(MetadataError::Corruption(format!(
                    "chunk {} is filed under document {} but belongs to {}",
                    chunk.id, document.id, chunk.document_id
                )));
            }
            chunks.push(chunk);
        }
        if state.documents.contains_key(&document.id) {
            return Err(MetadataError::Corruption(format!(
                "duplicate document {}",
                document.id
            )));
        }
        state.insert(document, chunks);
    }
    reader.finish().map_err(corruption)?;
    Ok(state)
}

/// Stream `queries.jsonl`, keeping the newest `capacity` entries and counting all of them.
async fn load_queries(path: &Path, capacity: usize) -> Result<QueryLogBuffer, MetadataError> {
    let mut buffer = QueryLogBuffer::new(capacity);
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(buffer),
        Err(error) => return Err(error.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut line_number = 0_usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QueryLog>(&line) {
            Ok(log) => buffer.push(log),
            Err(error) => {
                warn!(line = line_number, error = %error, "Skipping malformed query log entry");
            }
        }
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RetrievedChunk;

    fn document(id: &str, hash: &str, category: &str, tags: &[&str]) -> (Document, Vec<ChunkRecord>) {
        let chunks = vec![
            ChunkRecord {
                id: format!("{id}-0"),
                document_id: id.into(),
                ordinal: 0,
                text: "first passage".into(),
                token_count: 2,
                byte_start: 0,
                byte_end: 13,
            },
            ChunkRecord {
                id: format!("{id}-1"),
                document_id: id.into(),
                ordinal: 1,
                text: "second passage".into(),
                token_count: 2,
                byte_start: 14,
                byte_end: 28,
            },
        ];
        let document = Document {
            id: id.into(),
            content_hash: hash.into(),
            source: Some(format!("{id}.txt")),
            category: category.into(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            notes: None,
            size_bytes: 28,
            created_at: "2024-05-01T12:00:00Z".into(),
            chunk_count: chunks.len(),
        };
        (document, chunks)
    }

    fn query(text: &str) -> QueryLog {
        QueryLog {
            id: format!("q-{text}"),
            query_text: text.into(),
            retrieved: vec![RetrievedChunk {
                chunk_id: "doc-a-0".into(),
                score: 0.5,
            }],
            answer: Some("answer".into()),
            no_context: false,
            error: None,
            failed_stage: None,
            timestamp: "2024-05-01T12:00:00Z".into(),
            latency_ms: 4,
        }
    }

    async fn seeded(store: &LocalMetadataStore) {
        let (doc_a, chunks_a) = document("doc-a", "hash-a", "web", &["sql"]);
        let (doc_b, chunks_b) = document("doc-b", "hash-b", "net", &["tcp", "sql"]);
        store.record_document(doc_a, chunks_a).await.expect("a");
        store.record_document(doc_b, chunks_b).await.expect("b");
    }

    #[tokio::test]
    async fn looks_up_documents_by_hash_and_id() {
        let store = LocalMetadataStore::in_memory();
        seeded(&store).await;

        let found = store.get_by_hash("hash-b").await.expect("lookup");
        assert_eq!(found.map(|doc| doc.id), Some("doc-b".to_string()));
        assert!(store.get_by_hash("hash-z").await.expect("lookup").is_none());
        assert!(matches!(
            store.get("missing").await,
            Err(MetadataError::NotFound(_))
        ));

        let chunks = store
            .chunks(&["doc-b-1".into(), "unknown".into(), "doc-a-0".into()])
            .await
            .expect("chunks");
        let ids: Vec<_> = chunks.iter().map(|chunk| chunk.id.as_str()).collect();
        assert_eq!(ids, ["doc-b-1", "doc-a-0"]);
    }

    #[tokio::test]
    async fn lists_newest_first_with_filters() {
        let store = LocalMetadataStore::in_memory();
        seeded(&store).await;

        let all = store.list(&DocumentFilter::default()).await.expect("list");
        let ids: Vec<_> = all.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, ["doc-b", "doc-a"]);

        let web = store
            .list(&DocumentFilter {
                category: Some("web".into()),
                ..DocumentFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(web.len(), 1);

        let tagged = store
            .list(&DocumentFilter {
                tag: Some("sql".into()),
                limit: Some(1),
                ..DocumentFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, "doc-b");
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks_and_hash() {
        let store = LocalMetadataStore::in_memory();
        seeded(&store).await;

        let (document, chunk_ids) = store
            .delete("doc-a")
            .await
            .expect("delete")
            .expect("existed");
        assert_eq!(document.id, "doc-a");
        assert_eq!(chunk_ids, vec!["doc-a-0".to_string(), "doc-a-1".to_string()]);
        assert!(store.get_by_hash("hash-a").await.expect("lookup").is_none());
        assert!(store.chunks(&chunk_ids).await.expect("chunks").is_empty());
        assert!(store.delete("doc-a").await.expect("second delete").is_none());
        assert_eq!(store.counts().await.documents, 1);
    }

    #[tokio::test]
    async fn update_metadata_replaces_category_and_tags() {
        let store = LocalMetadataStore::in_memory();
        seeded(&store).await;
        let updated = store
            .update_metadata("doc-a", Some("appsec".into()), None)
            .await
            .expect("update");
        assert_eq!(updated.category, "appsec");
        assert_eq!(updated.tags, vec!["sql".to_string()]);
        assert!(matches!(
            store.update_metadata("missing", None, None).await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn flush_and_reopen_restores_documents_and_queries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalMetadataStore::open(dir.path()).await.expect("open");
        seeded(&store).await;
        store.record_query(query("first")).await.expect("log");
        store.record_query(query("second")).await.expect("log");
        let stamp = SnapshotStamp {
            dimension: 384,
            generation: 3,
        };
        store.flush(stamp).await.expect("flush");

        let reopened = LocalMetadataStore::open(dir.path()).await.expect("reopen");
        assert_eq!(reopened.stamp().await, Some(stamp));
        assert_eq!(
            reopened.counts().await,
            StoreCounts {
                documents: 2,
                chunks: 4,
                queries: 2,
            }
        );
        let recent = reopened.recent_queries(1).await.expect("recent");
        assert_eq!(recent[0].query_text, "second");
        let listed = reopened
            .list(&DocumentFilter::default())
            .await
            .expect("list");
        assert_eq!(listed[0].id, "doc-b");
        let chunks = reopened.chunks_for("doc-a").await.expect("chunks");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].ordinal, 1);
    }

    #[tokio::test]
    async fn damaged_snapshot_is_reported_as_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalMetadataStore::open(dir.path()).await.expect("open");
        seeded(&store).await;
        store
            .flush(SnapshotStamp {
                dimension: 8,
                generation: 1,
            })
            .await
            .expect("flush");

        let path = dir.path().join(DOCUMENTS_FILE);
        let mut bytes = std::fs::read(&path).expect("read");
        bytes.truncate(bytes.len() - 1);
        std::fs::write(&path, bytes).expect("write");

        assert!(matches!(
            LocalMetadataStore::open(dir.path()).await,
            Err(MetadataError::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn rejects_chunk_count_mismatch() {
        let store = LocalMetadataStore::in_memory();
        let (mut doc, chunks) = document("doc-c", "hash-c", "web", &[]);
        doc.chunk_count = 5;
        assert!(matches!(
            store.record_document(doc, chunks).await,
            Err(MetadataError::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn query_history_is_bounded_but_fully_counted() {
        let store = LocalMetadataStore {
            dir: None,
            state: RwLock::new(StoreState::default()),
            queries: Mutex::new(QueryLogBuffer::new(2)),
        };
        for text in ["one", "two", "three"] {
            store.record_query(query(text)).await.expect("log");
        }

        let recent = store.recent_queries(10).await.expect("recent");
        let texts: Vec<_> = recent.iter().map(|log| log.query_text.as_str()).collect();
        assert_eq!(texts, ["three", "two"]);
        assert_eq!(store.counts().await.queries, 3);
    }

    #[tokio::test]
    async fn loading_the_query_log_keeps_only_the_newest_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(QUERIES_FILE);
        let mut contents = String::new();
        for text in ["a", "b", "c", "d"] {
            contents.push_str(&serde_json::to_string(&query(text)).expect("json"));
            contents.push('\n');
        }
        contents.push_str("not json\n");
        std::fs::write(&path, contents).expect("write");

        let buffer = load_queries(&path, 2).await.expect("load");
        assert_eq!(buffer.total, 4);
        let texts: Vec<_> = buffer.recent.iter().map(|log| log.query_text.as_str()).collect();
        assert_eq!(texts, ["c", "d"]);
    }
}
