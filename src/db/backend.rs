//! Store contracts shared by the SQLite and in-memory backends.
//!
//! Components receive these as injected handles (see [`super::Stores`])
//! rather than reaching for a global connection.

use std::io::{self, Read, Write};

use crate::error::{Result, StoreError};
use crate::model::{Blob, BlobId, ImageRecord, NewImageRecord, RecordId};
use crate::query::Predicate;
use crate::tasks::CancelToken;

/// Chunk size for every streamed transfer.
pub const STREAM_BUFFER_SIZE: usize = 8192;

pub const DEFAULT_MAX_BLOB_BYTES: u64 = 4 * 1024 * 1024;

pub const DEFAULT_SNIFF_BYTES: usize = 512;

pub const UNKNOWN_CONTENT_TYPE: &str = "application/octet-stream";

/// Persistence of raw image bytes.
pub trait BlobStore: Send + Sync {
    /// Consume `reader`, persist its bytes with a sniffed content type and
    /// return the new blob's id.
    fn create_blob(&self, reader: &mut dyn Read, cancel: &CancelToken) -> Result<BlobId>;

    /// Open a blob for a single streaming pass, with its stored content type.
    fn open_blob(&self, id: &BlobId) -> Result<(BlobReader, String)>;

    fn blob_info(&self, id: &BlobId) -> Result<Blob>;

    /// Remove a blob. Returns false if it did not exist.
    fn delete_blob(&self, id: &BlobId) -> Result<bool>;
}

/// Persistence of [`ImageRecord`]s.
pub trait MetadataStore: Send + Sync {
    fn insert(&self, record: NewImageRecord) -> Result<RecordId>;

    fn find_by_id(&self, id: &RecordId) -> Result<ImageRecord>;

    /// Records matching `predicate`, ordered by id.
    fn find(&self, predicate: &Predicate) -> Result<Vec<ImageRecord>>;

    /// Replace the record's tags with the de-duplicated `tags`.
    fn replace_tags(&self, id: &RecordId, tags: &[String]) -> Result<()>;

    /// Cache `hash` on the record only if it still references `expected_blob`.
    /// Returns whether the write applied.
    fn set_cached_hash(&self, id: &RecordId, expected_blob: &BlobId, hash: &str) -> Result<bool>;

    fn count(&self) -> Result<usize>;

    /// Delete every record carrying `tag`, returning what was removed.
    fn remove_tagged(&self, tag: &str) -> Result<Vec<ImageRecord>>;

    fn is_blob_referenced(&self, blob: &BlobId) -> Result<bool>;

    /// Look up a record by a caller-supplied id string.
    fn lookup(&self, raw_id: &str) -> Result<ImageRecord> {
        let id = RecordId::parse(raw_id)?;
        self.find_by_id(&id)
    }
}

/// A readable, single-pass blob stream. The underlying handle is released
/// when the reader is dropped.
pub struct BlobReader {
    id: BlobId,
    inner: Box<dyn Read + Send>,
}

impl BlobReader {
    pub fn new(id: BlobId, inner: impl Read + Send + 'static) -> Self {
        Self {
            id,
            inner: Box::new(inner),
        }
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader").field("id", &self.id).finish()
    }
}

/// Upload policy applied while streaming a new blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLimits {
    /// `None` disables the size cap.
    pub max_size_bytes: Option<u64>,
    pub sniff_bytes: usize,
}

impl Default for BlobLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: Some(DEFAULT_MAX_BLOB_BYTES),
            sniff_bytes: DEFAULT_SNIFF_BYTES,
        }
    }
}

/// Outcome of streaming a blob into its medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamedBlob {
    pub size: u64,
    pub content_type: String,
}

/// Copy `reader` into `writer` one buffer at a time, enforcing the size cap
/// and capturing the prefix used for content sniffing.
pub(crate) fn stream_blob(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    limits: &BlobLimits,
    cancel: &CancelToken,
    id: &BlobId,
) -> Result<StreamedBlob> {
    const OP: &str = "create_blob";

    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    let mut prefix: Vec<u8> = Vec::with_capacity(limits.sniff_bytes);
    let mut size: u64 = 0;

    loop {
        cancel.check(OP)?;
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::io(OP, id.as_str(), e)),
        };

        size += bytes_read as u64;
        if let Some(max) = limits.max_size_bytes {
            if size > max {
                return Err(StoreError::invalid(
                    OP,
                    format!("blob exceeds the {} byte limit", max),
                ));
            }
        }

        if prefix.len() < limits.sniff_bytes {
            let take = (limits.sniff_bytes - prefix.len()).min(bytes_read);
            prefix.extend_from_slice(&buffer[..take]);
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| StoreError::io(OP, id.as_str(), e))?;
    }

    writer
        .flush()
        .map_err(|e| StoreError::io(OP, id.as_str(), e))?;

    Ok(StreamedBlob {
        size,
        content_type: sniff_content_type(&prefix).to_string(),
    })
}

/// Classify content from its leading bytes.
pub fn sniff_content_type(prefix: &[u8]) -> &'static str {
    match image::guess_format(prefix) {
        Ok(format) => format.to_mime_type(),
        Err(_) => UNKNOWN_CONTENT_TYPE,
    }
}
