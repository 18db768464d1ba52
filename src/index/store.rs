use super::snapshot;
use super::types::{EntryMetadata, IndexEntry, IndexError, IndexHit, Metric, SearchFilter};
use crate::storage::{SnapshotStamp, write_atomic};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Exact nearest-neighbor index over fixed-dimension vectors.
///
/// Vectors live in one contiguous buffer and every search is a brute-force scan. Mutations take
/// the write lock for the whole batch, so searches observe either all or none of an `add` or
/// `remove` call.
pub struct VectorIndex {
    dimension: usize,
    metric: Metric,
    state: RwLock<IndexState>,
}

#[derive(Default)]
struct IndexState {
    ids: Vec<String>,
    metadata: Vec<EntryMetadata>,
    vectors: Vec<f32>,
    positions: HashMap<String, usize>,
    generation: u64,
}

impl IndexState {
    fn vector(&self, slot: usize, dimension: usize) -> &[f32] {
        &self.vectors[slot * dimension..(slot + 1) * dimension]
    }

    fn upsert(&mut self, entry: IndexEntry, dimension: usize) {
        if let Some(&slot) = self.positions.get(&entry.chunk_id) {
            self.vectors[slot * dimension..(slot + 1) * dimension].copy_from_slice(&entry.vector);
            self.metadata[slot] = entry.metadata;
            return;
        }
        let slot = self.ids.len();
        self.positions.insert(entry.chunk_id.clone(), slot);
        self.ids.push(entry.chunk_id);
        self.metadata.push(entry.metadata);
        self.vectors.extend_from_slice(&entry.vector);
    }

    fn remove_slot(&mut self, slot: usize, dimension: usize) {
        let last = self.ids.len() - 1;
        let removed = self.ids.swap_remove(slot);
        self.metadata.swap_remove(slot);
        self.positions.remove(&removed);
        if slot != last {
            let (head, tail) = self.vectors.split_at_mut(last * dimension);
            head[slot * dimension..(slot + 1) * dimension].copy_from_slice(&tail[..dimension]);
            self.positions.insert(self.ids[slot].clone(), slot);
        }
        self.vectors.truncate(last * dimension);
    }
}

impl VectorIndex {
    /// Create an empty index. The dimension is fixed for the lifetime of the instance.
    pub fn new(dimension: usize, metric: Metric) -> Result<Self, IndexError> {
        if dimension == 0 {
            return Err(IndexError::InvalidVector(
                "index dimension must be positive".into(),
            ));
        }
        Ok(Self {
            dimension,
            metric,
            state: RwLock::new(IndexState::default()),
        })
    }

    /// Dimension every stored vector must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Metric used for scoring.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Insert or replace vectors. The batch is validated before anything is written.
    pub async fn add(&self, entries: Vec<IndexEntry>) -> Result<usize, IndexError> {
        let mut prepared = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.vector = self.prepare(entry.vector)?;
            prepared.push(entry);
        }

        let count = prepared.len();
        let mut state = self.state.write().await;
        for entry in prepared {
            state.upsert(entry, self.dimension);
        }
        debug!(count, total = state.ids.len(), "Vectors added to index");
        Ok(count)
    }

    /// Top-`k` entries by descending similarity. Ties are ordered by chunk id.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.search_filtered(query, k, &SearchFilter::default())
            .await
    }

    /// Like [`VectorIndex::search`] but only ranks entries accepted by `filter`.
    pub async fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<IndexHit>, IndexError> {
        let query = self.prepare(query.to_vec())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut scored: Vec<(usize, f32)> = (0..state.ids.len())
            .filter(|slot| filter.matches(&state.metadata[*slot]))
            .map(|slot| (slot, dot(&query, state.vector(slot, self.dimension))))
            .collect();
        scored.sort_by(|(a_slot, a), (b_slot, b)| {
            b.total_cmp(a)
                .then_with(|| state.ids[*a_slot].cmp(&state.ids[*b_slot]))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(slot, score)| IndexHit {
                chunk_id: state.ids[slot].clone(),
                score,
                metadata: state.metadata[slot].clone(),
            })
            .collect())
    }

    /// Remove the given chunk ids. Unknown ids are ignored; returns how many were removed.
    pub async fn remove(&self, chunk_ids: &[String]) -> usize {
        let mut state = self.state.write().await;
        let mut removed = 0;
        for chunk_id in chunk_ids {
            if let Some(&slot) = state.positions.get(chunk_id) {
                state.remove_slot(slot, self.dimension);
                removed += 1;
            }
        }
        removed
    }

    /// Remove every vector owned by `document_id`, returning the removed chunk ids.
    pub async fn remove_document(&self, document_id: &str) -> Vec<String> {
        let mut state = self.state.write().await;
        let doomed: Vec<String> = state
            .ids
            .iter()
            .zip(&state.metadata)
            .filter(|(_, metadata)| metadata.document_id == document_id)
            .map(|(id, _)| id.clone())
            .collect();
        for chunk_id in &doomed {
            if let Some(&slot) = state.positions.get(chunk_id) {
                state.remove_slot(slot, self.dimension);
            }
        }
        doomed
    }

    /// Rewrite the category stored with every vector of `document_id`.
    pub async fn update_category(&self, document_id: &str, category: &str) -> usize {
        let mut state = self.state.write().await;
        let mut touched = 0;
        for metadata in state
            .metadata
            .iter_mut()
            .filter(|metadata| metadata.document_id == document_id)
        {
            metadata.category = category.to_string();
            touched += 1;
        }
        touched
    }

    /// Number of stored vectors.
    pub async fn len(&self) -> usize {
        self.state.read().await.ids.len()
    }

    /// Whether the index holds no vectors.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every vector, keeping the dimension, metric and generation. Returns how many went.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.write().await;
        let removed = state.ids.len();
        state.ids.clear();
        state.metadata.clear();
        state.vectors.clear();
        state.positions.clear();
        removed
    }

    /// Stamp of the last snapshot written or loaded.
    pub async fn stamp(&self) -> SnapshotStamp {
        SnapshotStamp {
            dimension: self.dimension as u32,
            generation: self.state.read().await.generation,
        }
    }

    /// Write a snapshot atomically and bump the generation.
    ///
    /// The write lock is held for the duration, so the snapshot reflects a single point in the
    /// mutation history.
    pub async fn persist(&self, path: &Path) -> Result<SnapshotStamp, IndexError> {
        let mut state = self.state.write().await;
        let generation = state.generation + 1;
        let bytes = snapshot::encode(
            self.metric,
            self.dimension,
            generation,
            (0..state.ids.len()).map(|slot| {
                (
                    state.ids[slot].as_str(),
                    &state.metadata[slot],
                    state.vector(slot, self.dimension),
                )
            }),
        )?;
        write_atomic(path, &bytes).await?;
        state.generation = generation;
        info!(
            path = %path.display(),
            vectors = state.ids.len(),
            generation,
            "Index snapshot written"
        );
        Ok(SnapshotStamp {
            dimension: self.dimension as u32,
            generation,
        })
    }

    /// Load a snapshot, rejecting it when its dimension or metric differs from the expected ones.
    pub async fn load(
        path: &Path,
        expected_dimension: usize,
        expected_metric: Metric,
    ) -> Result<Self, IndexError> {
        let bytes = tokio::fs::read(path).await?;
        let decoded = snapshot::decode(&bytes)?;
        if decoded.dimension != expected_dimension {
            return Err(IndexError::Corruption(format!(
                "snapshot dimension {} does not match configured dimension {expected_dimension}",
                decoded.dimension
            )));
        }
        if decoded.metric != expected_metric {
            return Err(IndexError::Corruption(format!(
                "snapshot metric {:?} does not match configured metric {expected_metric:?}",
                decoded.metric
            )));
        }
        if decoded.metric == Metric::Cosine {
            let skewed = decoded
                .entries
                .iter()
                .find(|(_, _, vector)| (norm(vector) - 1.0).abs() > 1e-3);
            if let Some((chunk_id, _, _)) = skewed {
                return Err(IndexError::Corruption(format!(
                    "vector for chunk {chunk_id} is not unit length"
                )));
            }
        }

        let mut state = IndexState {
            generation: decoded.generation,
            ..IndexState::default()
        };
        let count = decoded.entries.len();
        for (chunk_id, metadata, vector) in decoded.entries {
            state.upsert(
                IndexEntry {
                    chunk_id,
                    vector,
                    metadata,
                },
                decoded.dimension,
            );
        }
        info!(
            path = %path.display(),
            vectors = count,
            generation = decoded.generation,
            "Index snapshot loaded"
        );
        Ok(Self {
            dimension: decoded.dimension,
            metric: decoded.metric,
            state: RwLock::new(state),
        })
    }

    fn prepare(&self, mut vector: Vec<f32>) -> Result<Vec<f32>, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(IndexError::InvalidVector(
                "vector contains non-finite values".into(),
            ));
        }
        if self.metric == Metric::Cosine {
            let length = norm(&vector);
            if length == 0.0 || !length.is_finite() {
                return Err(IndexError::InvalidVector(
                    "zero-length vector cannot be normalized".into(),
                ));
            }
            vector.iter_mut().for_each(|value| *value /= length);
        }
        Ok(vector)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(vector: &[f32]) -> f32 {
    dot(vector, vector).sqrt()
}
