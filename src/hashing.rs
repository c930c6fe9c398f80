//! Content fingerprints for duplicate detection.
//!
//! A fingerprint is the 32-bit xxHash (seed 0) of a blob's bytes, rendered
//! as 8 lowercase hex digits. It is not a cryptographic digest.

use std::hash::Hasher;
use std::io::{ErrorKind, Read};

use tracing::{debug, warn};
use twox_hash::XxHash32;

use crate::db::{Stores, STREAM_BUFFER_SIZE};
use crate::error::{Result, StoreError};
use crate::model::{BlobId, ImageRecord};
use crate::tasks::CancelToken;

const OP: &str = "content_hash";

/// Stream `reader` to the end and return its fingerprint.
pub fn hash_reader<R: Read>(mut reader: R, blob: &BlobId, cancel: &CancelToken) -> Result<String> {
    let mut hasher = XxHash32::with_seed(0);
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];

    loop {
        cancel.check(OP)?;
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::io(OP, blob.as_str(), e)),
        };
        hasher.write(&buffer[..bytes_read]);
    }

    Ok(format!("{:08x}", hasher.finish() as u32))
}

/// Fingerprint of the record's blob.
///
/// Returns the cached value when the record carries one. Otherwise hashes
/// the blob and tries to cache the result against the blob the record
/// referenced when it was read; a failed or skipped cache write is logged
/// and the computed hash is still returned.
pub fn content_hash(stores: &Stores, record: &ImageRecord, cancel: &CancelToken) -> Result<String> {
    if let Some(hash) = &record.cached_hash {
        return Ok(hash.clone());
    }

    let (reader, _content_type) = stores.blobs().open_blob(&record.blob_ref)?;
    let hash = hash_reader(reader, &record.blob_ref, cancel)?;

    match stores
        .records()
        .set_cached_hash(&record.id, &record.blob_ref, &hash)
    {
        Ok(true) => debug!(record_id = %record.id, hash = %hash, "Cached content hash"),
        Ok(false) => debug!(
            record_id = %record.id,
            "Record changed since it was read, content hash not cached"
        ),
        Err(e) => warn!(record_id = %record.id, error = %e, "Failed to cache content hash"),
    }

    Ok(hash)
}
