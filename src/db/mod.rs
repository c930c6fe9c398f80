mod schema;
pub mod backend;
pub mod memory;
pub mod sqlite;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

pub use backend::{
    sniff_content_type, BlobLimits, BlobReader, BlobStore, MetadataStore, DEFAULT_MAX_BLOB_BYTES,
    DEFAULT_SNIFF_BYTES, STREAM_BUFFER_SIZE, UNKNOWN_CONTENT_TYPE,
};
pub use memory::MemoryStore;
pub use sqlite::SqliteDb;

use crate::config::Config;
use crate::error::{Result, StoreError};

/// Handle to the two logical collections, passed to every component.
///
/// Cloning is cheap; clones share the same backends and the same merge lock.
#[derive(Clone)]
pub struct Stores {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn MetadataStore>,
    merge_lock: Arc<Mutex<()>>,
}

impl Stores {
    pub fn new(blobs: Arc<dyn BlobStore>, records: Arc<dyn MetadataStore>) -> Self {
        Self {
            blobs,
            records,
            merge_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the SQLite backend described by `config`, creating it if needed.
    pub fn open(config: &Config) -> Result<Self> {
        let db = SqliteDb::open(&config.db_path, &config.blobs.path, config.blobs.limits())?;
        db.initialize()?;
        info!(db_path = ?config.db_path, blob_dir = ?config.blobs.path, "Store opened");

        let db = Arc::new(db);
        Ok(Self::new(db.clone(), db))
    }

    /// An ephemeral store held entirely in memory.
    pub fn in_memory(limits: BlobLimits) -> Self {
        let store = Arc::new(MemoryStore::new(limits));
        Self::new(store.clone(), store)
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn records(&self) -> &dyn MetadataStore {
        self.records.as_ref()
    }

    /// Serialises merge passes run through clones of this handle.
    pub(crate) fn lock_merges(&self, op: &'static str) -> Result<MutexGuard<'_, ()>> {
        self.merge_lock
            .lock()
            .map_err(|_| StoreError::storage(op, "merge lock", "lock poisoned"))
    }
}
