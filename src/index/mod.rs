//! In-memory exact vector index with versioned, checksummed snapshots.

mod snapshot;
mod store;
pub mod types;

pub use store::VectorIndex;
pub use types::{EntryMetadata, IndexEntry, IndexError, IndexHit, Metric, SearchFilter};
