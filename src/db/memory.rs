//! In-process backend. Holds everything behind one lock; used as a test
//! double and for throwaway stores.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::backend::{stream_blob, BlobLimits, BlobReader, BlobStore, MetadataStore};
use crate::error::{Result, StoreError};
use crate::model::{normalize_tags, Blob, BlobId, ImageRecord, NewImageRecord, RecordId};
use crate::query::Predicate;
use crate::tasks::CancelToken;

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<RecordId, ImageRecord>,
    blobs: HashMap<BlobId, (Blob, Arc<[u8]>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    limits: BlobLimits,
}

impl MemoryStore {
    pub fn new(limits: BlobLimits) -> Self {
        Self {
            state: RwLock::default(),
            limits,
        }
    }

    fn read(&self, op: &'static str) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StoreError::storage(op, "memory store", "lock poisoned"))
    }

    fn write(&self, op: &'static str) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError::storage(op, "memory store", "lock poisoned"))
    }
}

impl BlobStore for MemoryStore {
    fn create_blob(&self, reader: &mut dyn Read, cancel: &CancelToken) -> Result<BlobId> {
        let id = BlobId::generate();
        let mut content = Vec::new();
        let streamed = stream_blob(reader, &mut content, &self.limits, cancel, &id)?;

        let blob = Blob {
            id: id.clone(),
            content_type: streamed.content_type,
            size: streamed.size,
        };
        self.write("create_blob")?
            .blobs
            .insert(id.clone(), (blob, Arc::from(content)));
        Ok(id)
    }

    fn open_blob(&self, id: &BlobId) -> Result<(BlobReader, String)> {
        const OP: &str = "open_blob";

        let state = self.read(OP)?;
        let (blob, content) = state
            .blobs
            .get(id)
            .ok_or_else(|| StoreError::not_found(OP, "blob", id.as_str()))?;
        let reader = BlobReader::new(id.clone(), Cursor::new(Arc::clone(content)));
        Ok((reader, blob.content_type.clone()))
    }

    fn blob_info(&self, id: &BlobId) -> Result<Blob> {
        const OP: &str = "blob_info";

        self.read(OP)?
            .blobs
            .get(id)
            .map(|(blob, _)| blob.clone())
            .ok_or_else(|| StoreError::not_found(OP, "blob", id.as_str()))
    }

    fn delete_blob(&self, id: &BlobId) -> Result<bool> {
        let mut state = self.write("delete_blob")?;
        if state.records.values().any(|r| &r.blob_ref == id) {
            return Err(StoreError::storage(
                "delete_blob",
                id.as_str(),
                "blob is still referenced",
            ));
        }
        Ok(state.blobs.remove(id).is_some())
    }
}

impl MetadataStore for MemoryStore {
    fn insert(&self, record: NewImageRecord) -> Result<RecordId> {
        const OP: &str = "insert";

        let mut state = self.write(OP)?;
        if !state.blobs.contains_key(&record.blob_ref) {
            return Err(StoreError::storage(
                OP,
                record.blob_ref.as_str(),
                "referenced blob does not exist",
            ));
        }

        let id = RecordId::generate();
        state.records.insert(
            id.clone(),
            ImageRecord {
                id: id.clone(),
                original_name: record.original_name,
                tags: normalize_tags(&record.tags),
                blob_ref: record.blob_ref,
                cached_hash: None,
            },
        );
        Ok(id)
    }

    fn find_by_id(&self, id: &RecordId) -> Result<ImageRecord> {
        const OP: &str = "find_by_id";

        self.read(OP)?
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(OP, "record", id.as_str()))
    }

    fn find(&self, predicate: &Predicate) -> Result<Vec<ImageRecord>> {
        Ok(self
            .read("find")?
            .records
            .values()
            .filter(|r| predicate.matches(&r.tags))
            .cloned()
            .collect())
    }

    fn replace_tags(&self, id: &RecordId, tags: &[String]) -> Result<()> {
        const OP: &str = "replace_tags";

        let mut state = self.write(OP)?;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(OP, "record", id.as_str()))?;
        record.tags = normalize_tags(tags);
        Ok(())
    }

    fn set_cached_hash(&self, id: &RecordId, expected_blob: &BlobId, hash: &str) -> Result<bool> {
        let mut state = self.write("set_cached_hash")?;
        match state.records.get_mut(id) {
            Some(record) if &record.blob_ref == expected_blob => {
                record.cached_hash = Some(hash.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read("count")?.records.len())
    }

    fn remove_tagged(&self, tag: &str) -> Result<Vec<ImageRecord>> {
        let mut state = self.write("remove_tagged")?;
        let doomed: Vec<RecordId> = state
            .records
            .values()
            .filter(|r| r.has_tag(tag))
            .map(|r| r.id.clone())
            .collect();
        Ok(doomed
            .iter()
            .filter_map(|id| state.records.remove(id))
            .collect())
    }

    fn is_blob_referenced(&self, blob: &BlobId) -> Result<bool> {
        Ok(self
            .read("is_blob_referenced")?
            .records
            .values()
            .any(|r| &r.blob_ref == blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::query::parse;

    fn add_image(store: &MemoryStore, content: &[u8], tags: &[&str]) -> RecordId {
        let blob = store
            .create_blob(&mut Cursor::new(content.to_vec()), &CancelToken::new())
            .unwrap();
        store
            .insert(NewImageRecord::new("upload", blob).with_tags(tags.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_find_matches_predicates() {
        let store = MemoryStore::default();
        let tagged = add_image(&store, b"a", &["a", "b"]);
        let untagged = add_image(&store, b"b", &[]);

        let ids = |q: &str| -> Vec<RecordId> {
            store.find(&parse(q)).unwrap().into_iter().map(|r| r.id).collect()
        };
        assert_eq!(ids(":all"), vec![tagged.clone(), untagged.clone()]);
        assert_eq!(ids(":untagged"), vec![untagged]);
        assert_eq!(ids("b a"), vec![tagged]);
    }

    #[test]
    fn test_blob_content_is_shared_not_copied_per_reader() {
        let store = MemoryStore::default();
        let id = store
            .create_blob(&mut Cursor::new(b"PNGDATA".to_vec()), &CancelToken::new())
            .unwrap();

        for _ in 0..2 {
            let (mut reader, content_type) = store.open_blob(&id).unwrap();
            let mut out = String::new();
            reader.read_to_string(&mut out).unwrap();
            assert_eq!(out, "PNGDATA");
            assert_eq!(content_type, "application/octet-stream");
        }
    }

    #[test]
    fn test_referenced_blob_cannot_be_deleted() {
        let store = MemoryStore::default();
        let id = add_image(&store, b"bytes", &[]);
        let blob = store.find_by_id(&id).unwrap().blob_ref;

        let err = store.delete_blob(&blob).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);

        store.replace_tags(&id, &["_delete".to_string()]).unwrap();
        store.remove_tagged("_delete").unwrap();
        assert!(store.delete_blob(&blob).unwrap());
    }
}
