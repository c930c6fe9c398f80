//! Upload flow: the blob is written first, then the record that references it.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db::Stores;
use crate::error::{Result, StoreError};
use crate::model::{ImageRecord, NewImageRecord};
use crate::tasks::CancelToken;

/// Store the bytes of `reader` as a new image tagged with `tags`.
///
/// Empty tags are dropped and duplicates collapse. If the record cannot be
/// inserted, the freshly written blob is removed again; a failure to remove
/// it is logged and the insert error is returned.
pub fn ingest<T: AsRef<str>>(
    stores: &Stores,
    reader: &mut dyn Read,
    original_name: &str,
    tags: &[T],
    cancel: &CancelToken,
) -> Result<ImageRecord> {
    let blob = stores.blobs().create_blob(reader, cancel)?;
    let record = NewImageRecord::new(original_name, blob.clone())
        .with_tags(tags.iter().map(|t| t.as_ref()));

    let id = match stores.records().insert(record) {
        Ok(id) => id,
        Err(e) => {
            if let Err(cleanup) = stores.blobs().delete_blob(&blob) {
                warn!(blob_id = %blob, error = %cleanup, "Failed to remove orphaned blob");
            }
            return Err(e);
        }
    };

    let record = stores.records().find_by_id(&id)?;
    debug!(record_id = %id, blob_id = %blob, name = original_name, "Ingested image");
    Ok(record)
}

/// Ingest a file from disk, recording its file name as the original name.
pub fn ingest_file<T: AsRef<str>>(
    stores: &Stores,
    path: &Path,
    tags: &[T],
    cancel: &CancelToken,
) -> Result<ImageRecord> {
    const OP: &str = "ingest_file";

    let display = path.display().to_string();
    let file = File::open(path).map_err(|e| StoreError::io(OP, display.as_str(), e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(display);

    ingest(stores, &mut BufReader::new(file), &name, tags, cancel)
}

/// Expand `paths` into the files to import.
///
/// Files are taken as given. Directories are walked recursively and only
/// files whose extension matches `extensions` (case-insensitive) are kept.
/// The result is sorted and free of duplicates.
pub fn collect_import_paths(paths: &[PathBuf], extensions: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let candidate = entry.path();
                if candidate.is_file() && has_extension(candidate, extensions) {
                    files.push(candidate.to_path_buf());
                }
            }
        } else {
            files.push(path.clone());
        }
    }

    files.sort();
    files.dedup();
    info!(count = files.len(), "Collected files to import");
    files
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BlobLimits, BlobReader, BlobStore, MemoryStore, MetadataStore};
    use crate::error::ErrorKind;
    use crate::model::{normalize_tags, Blob, BlobId, RecordId};
    use crate::query::Predicate;
    use std::fs;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Metadata store whose inserts always fail.
    struct RejectingRecords(MemoryStore);

    impl MetadataStore for RejectingRecords {
        fn insert(&self, _record: NewImageRecord) -> Result<RecordId> {
            Err(StoreError::storage("insert", "images", "write rejected"))
        }
        fn find_by_id(&self, id: &RecordId) -> Result<ImageRecord> {
            self.0.find_by_id(id)
        }
        fn find(&self, predicate: &Predicate) -> Result<Vec<ImageRecord>> {
            self.0.find(predicate)
        }
        fn replace_tags(&self, id: &RecordId, tags: &[String]) -> Result<()> {
            self.0.replace_tags(id, tags)
        }
        fn set_cached_hash(&self, id: &RecordId, blob: &BlobId, hash: &str) -> Result<bool> {
            self.0.set_cached_hash(id, blob, hash)
        }
        fn count(&self) -> Result<usize> {
            self.0.count()
        }
        fn remove_tagged(&self, tag: &str) -> Result<Vec<ImageRecord>> {
            self.0.remove_tagged(tag)
        }
        fn is_blob_referenced(&self, blob: &BlobId) -> Result<bool> {
            self.0.is_blob_referenced(blob)
        }
    }

    /// Blob store that remembers the last blob it created.
    struct TrackingBlobs {
        inner: MemoryStore,
        last: std::sync::Mutex<Option<BlobId>>,
    }

    impl BlobStore for TrackingBlobs {
        fn create_blob(&self, reader: &mut dyn Read, cancel: &CancelToken) -> Result<BlobId> {
            let id = self.inner.create_blob(reader, cancel)?;
            *self.last.lock().unwrap() = Some(id.clone());
            Ok(id)
        }
        fn open_blob(&self, id: &BlobId) -> Result<(BlobReader, String)> {
            self.inner.open_blob(id)
        }
        fn blob_info(&self, id: &BlobId) -> Result<Blob> {
            self.inner.blob_info(id)
        }
        fn delete_blob(&self, id: &BlobId) -> Result<bool> {
            self.inner.delete_blob(id)
        }
    }

    #[test]
    fn test_ingest_stores_blob_and_tags() {
        let stores = Stores::in_memory(BlobLimits::default());
        let record = ingest(
            &stores,
            &mut Cursor::new(b"PNGDATA".to_vec()),
            "cat.png",
            &["cat", "", "fun", "cat"],
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(record.original_name, "cat.png");
        assert_eq!(record.tags, normalize_tags(["cat", "fun"]));
        assert_eq!(record.cached_hash, None);
        assert_eq!(stores.blobs().blob_info(&record.blob_ref).unwrap().size, 7);
        assert_eq!(stores.records().count().unwrap(), 1);
    }

    #[test]
    fn test_failed_insert_removes_blob() {
        let blobs = Arc::new(TrackingBlobs {
            inner: MemoryStore::default(),
            last: std::sync::Mutex::new(None),
        });
        let stores = Stores::new(blobs.clone(), Arc::new(RejectingRecords(MemoryStore::default())));

        let err = ingest(
            &stores,
            &mut Cursor::new(b"PNGDATA".to_vec()),
            "cat.png",
            &["cat"],
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        let blob = blobs.last.lock().unwrap().clone().unwrap();
        let err = stores.blobs().blob_info(&blob).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_oversized_upload_creates_nothing() {
        let stores = Stores::in_memory(BlobLimits {
            max_size_bytes: Some(4),
            ..BlobLimits::default()
        });
        let err = ingest(
            &stores,
            &mut Cursor::new(b"PNGDATA".to_vec()),
            "big.png",
            &[] as &[&str],
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(stores.records().count().unwrap(), 0);
    }

    #[test]
    fn test_ingest_file_uses_file_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("holiday.jpg");
        fs::write(&path, b"JPEGDATA").unwrap();
        let stores = Stores::in_memory(BlobLimits::default());

        let record = ingest_file(&stores, &path, &["beach"], &CancelToken::new()).unwrap();
        assert_eq!(record.original_name, "holiday.jpg");

        let missing = ingest_file(&stores, &dir.path().join("nope.jpg"), &["x"], &CancelToken::new())
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_collect_import_paths() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("photo1.jpg"), b"").unwrap();
        fs::write(dir.path().join("photo2.PNG"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir/photo3.jpeg"), b"").unwrap();
        let explicit = dir.path().join("notes.txt");

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let files = collect_import_paths(
            &[dir.path().to_path_buf(), explicit.clone(), dir.path().join("photo1.jpg")],
            &extensions,
        );

        assert_eq!(files.len(), 4);
        assert!(files.contains(&explicit));
        assert!(files.contains(&dir.path().join("subdir/photo3.jpeg")));
    }
}
