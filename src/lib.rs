//! Tagged image store with content-hash deduplication.
//!
//! Images are stored as immutable blobs plus metadata records carrying a
//! tag set. Records are found with a small tag query language, exact
//! duplicates are detected by content fingerprint and merged, and records
//! marked for deletion are swept in bulk.

pub mod config;
pub mod db;
pub mod duplicates;
pub mod error;
pub mod hashing;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod query;
pub mod sweep;
pub mod tags;
pub mod tasks;

pub use config::Config;
pub use db::{BlobStore, MetadataStore, Stores};
pub use duplicates::{Deduplicator, DuplicateGroup, MergeOutcome, MergeReport};
pub use error::{ErrorKind, Result, StoreError};
pub use model::{Blob, BlobId, ImageRecord, NewImageRecord, RecordId, TagInfo};
pub use query::Predicate;
pub use tasks::CancelToken;
