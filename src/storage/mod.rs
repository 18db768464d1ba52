//! On-disk building blocks shared by the vector index snapshot and the document store.
//!
//! Both files use the same envelope: a 4-byte magic, a little-endian `u16` format version,
//! length-prefixed fields, and a trailing SHA-256 of everything before it. Writes go through
//! [`write_atomic`] so readers only ever see a complete previous or complete new file.

mod atomic;
mod codec;

pub(crate) use atomic::write_atomic;
pub(crate) use codec::{CodecError, RecordReader, RecordWriter};

use serde::{Deserialize, Serialize};

/// Identity shared by an index snapshot and the document store written alongside it.
///
/// A mismatch between the stamps of the two files means they were not flushed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStamp {
    /// Embedding dimension of the index the store describes.
    pub dimension: u32,
    /// Monotonic flush counter.
    pub generation: u64,
}
