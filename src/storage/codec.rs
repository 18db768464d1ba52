use sha2::{Digest, Sha256};
use thiserror::Error;

const CHECKSUM_LEN: usize = 32;

/// Reasons a snapshot envelope can be rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// File does not start with the expected magic bytes.
    #[error("unrecognized file magic")]
    BadMagic,
    /// Payload ended before a field could be read.
    #[error("snapshot truncated at byte {0}")]
    Truncated(usize),
    /// Trailing digest does not match the payload.
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,
    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field at byte {0}")]
    InvalidUtf8(usize),
    /// Bytes remain after the last declared record.
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    /// A field is longer than its `u32` length prefix can express.
    #[error("field of {0} bytes exceeds the u32 length prefix")]
    FieldTooLarge(usize),
}

/// Append-only builder for a checksummed snapshot.
pub struct RecordWriter {
    buf: Vec<u8>,
    oversized: Option<usize>,
}

impl RecordWriter {
    /// Start a snapshot with its magic and format version.
    pub fn new(magic: &[u8; 4], version: u16) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(magic);
        buf.extend_from_slice(&version.to_le_bytes());
        Self {
            buf,
            oversized: None,
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a `u32` length followed by the raw bytes.
    ///
    /// A field too long for the prefix is skipped and reported by [`RecordWriter::finish`].
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.put_len(bytes.len()) {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Write a length or count as `u32`. Returns `false` and poisons the record when it does
    /// not fit.
    pub fn put_len(&mut self, len: usize) -> bool {
        match u32::try_from(len) {
            Ok(len) => {
                self.put_u32(len);
                true
            }
            Err(_) => {
                if self.oversized.is_none() {
                    self.oversized = Some(len);
                }
                false
            }
        }
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Seal the snapshot by appending the SHA-256 of its contents.
    pub fn finish(mut self) -> Result<Vec<u8>, CodecError> {
        if let Some(len) = self.oversized {
            return Err(CodecError::FieldTooLarge(len));
        }
        let digest = Sha256::digest(&self.buf);
        self.buf.extend_from_slice(&digest);
        Ok(self.buf)
    }
}

/// Cursor over a verified snapshot payload.
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    /// Verify magic and checksum, returning a reader positioned after the version header.
    pub fn open(bytes: &'a [u8], magic: &[u8; 4]) -> Result<(Self, u16), CodecError> {
        if bytes.len() < magic.len() + 2 + CHECKSUM_LEN {
            return Err(CodecError::Truncated(bytes.len()));
        }
        if &bytes[..4] != magic {
            return Err(CodecError::BadMagic);
        }
        let (payload, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(payload).as_slice() != checksum {
            return Err(CodecError::ChecksumMismatch);
        }
        let version = u16::from_le_bytes([payload[4], payload[5]]);
        Ok((
            Self {
                data: payload,
                pos: 6,
            },
            version,
        ))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.take_array().map(u64::from_le_bytes)
    }

    pub fn get_f32(&mut self) -> Result<f32, CodecError> {
        self.take_array().map(f32::from_le_bytes)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_str(&mut self) -> Result<&'a str, CodecError> {
        let start = self.pos;
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8(start))
    }

    /// Fail unless every byte of the payload has been consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        let remaining = self.data.len() - self.pos;
        if remaining == 0 {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(remaining))
        }
    }
}
