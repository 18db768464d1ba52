//! Versioned binary snapshot of the vector index.
//!
//! Layout (all integers little-endian), wrapped in the shared checksummed envelope:
//!
//! ```text
//! "RRVI" | version: u16 | metric: u8 | dimension: u32 | generation: u64 | count: u64
//! count × ( chunk_id: str | document_id: str | category: str | dimension × f32 )
//! sha256(all of the above)
//! ```

use super::types::{EntryMetadata, IndexError, Metric};
use crate::storage::{CodecError, RecordReader, RecordWriter};
use std::collections::HashSet;

const MAGIC: &[u8; 4] = b"RRVI";
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Decoded snapshot contents.
pub(crate) struct DecodedIndex {
    pub metric: Metric,
    pub dimension: usize,
    pub generation: u64,
    pub entries: Vec<(String, EntryMetadata, Vec<f32>)>,
}

pub(crate) fn encode<'a>(
    metric: Metric,
    dimension: usize,
    generation: u64,
    entries: impl ExactSizeIterator<Item = (&'a str, &'a EntryMetadata, &'a [f32])>,
) -> Result<Vec<u8>, IndexError> {
    let mut writer = RecordWriter::new(MAGIC, FORMAT_VERSION);
    writer.put_u8(metric.code());
    writer.put_len(dimension);
    writer.put_u64(generation);
    writer.put_u64(entries.len() as u64);
    for (chunk_id, metadata, vector) in entries {
        writer.put_str(chunk_id);
        writer.put_str(&metadata.document_id);
        writer.put_str(&metadata.category);
        for value in vector {
            writer.put_f32(*value);
        }
    }
    writer
        .finish()
        .map_err(|error| IndexError::Encoding(error.to_string()))
}

pub(crate) fn decode(bytes: &[u8]) -> Result<DecodedIndex, IndexError> {
    let (mut reader, version) = RecordReader::open(bytes, MAGIC).map_err(corruption)?;
    if version != FORMAT_VERSION {
        return Err(IndexError::Corruption(format!(
            "unsupported snapshot version {version} (expected {FORMAT_VERSION})"
        )));
    }
    let metric_code = reader.get_u8().map_err(corruption)?;
    let metric = Metric::from_code(metric_code)
        .ok_or_else(|| IndexError::Corruption(format!("unknown metric code {metric_code}")))?;
    let dimension = reader.get_u32().map_err(corruption)? as usize;
    if dimension == 0 {
        return Err(IndexError::Corruption("snapshot dimension is zero".into()));
    }
    let generation = reader.get_u64().map_err(corruption)?;
    let count = reader.get_u64().map_err(corruption)? as usize;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for _ in 0..count {
        let chunk_id = reader.get_str().map_err(corruption)?.to_string();
        let document_id = reader.get_str().map_err(corruption)?.to_string();
        let category = reader.get_str().map_err(corruption)?.to_string();
        let mut vector = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            let value = reader.get_f32().map_err(corruption)?;
            if !value.is_finite() {
                return Err(IndexError::Corruption(format!(
                    "non-finite component in vector for chunk {chunk_id}"
                )));
            }
            vector.push(value);
        }
        if !seen.insert(chunk_id.clone()) {
            return Err(IndexError::Corruption(format!("duplicate chunk id {chunk_id}")));
        }
        entries.push((
            chunk_id,
            EntryMetadata {
                document_id,
                category,
            },
            vector,
        ));
    }
    reader.finish().map_err(corruption)?;

    Ok(DecodedIndex {
        metric,
        dimension,
        generation,
        entries,
    })
}

fn corruption(error: CodecError) -> IndexError {
    IndexError::Corruption(error.to_string())
}
