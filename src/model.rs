//! Records, blobs and the identifiers that tie them together.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use md5::{Digest, Md5};

use crate::error::{Result, StoreError};

/// Tag that marks a record for removal by the next sweep.
pub const DELETE_TAG: &str = "_delete";

/// Length of a hex identifier: 12 bytes rendered as 24 hex digits.
pub const ID_LEN: usize = 24;

/// Generate a fresh 24-digit hex identifier.
///
/// Layout: 4 bytes of seconds since the epoch, 5 bytes fixed per process,
/// 3 bytes of counter. Ids from one process sort in creation order.
fn generate_hex_id() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static PROCESS: OnceLock<String> = OnceLock::new();

    let process = PROCESS.get_or_init(|| {
        let mut hasher = Md5::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(
            Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes(),
        );
        let digest = hasher.finalize();
        digest[..5].iter().map(|b| format!("{:02x}", b)).collect()
    });

    let secs = Utc::now().timestamp() as u32;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
    format!("{:08x}{}{:06x}", secs, process, seq)
}

fn parse_hex_id(op: &'static str, what: &str, raw: &str) -> Result<String> {
    if raw.len() != ID_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::invalid(
            op,
            format!("{:?} is not a valid {} id", raw, what),
        ));
    }
    Ok(raw.to_ascii_lowercase())
}

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(generate_hex_id())
            }

            /// Validate and normalise a caller-supplied identifier.
            pub fn parse(raw: &str) -> Result<Self> {
                parse_hex_id(concat!("parse_", $what, "_id"), $what, raw).map(Self)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Wrap an id read back from a backend that only stores valid ids.
            pub(crate) fn from_stored(raw: String) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }
    };
}

hex_id!(
    /// Identifier of an [`ImageRecord`].
    RecordId,
    "record"
);

hex_id!(
    /// Identifier of a stored blob.
    BlobId,
    "blob"
);

/// Stored blob information. The bytes themselves are read through
/// [`crate::db::BlobStore::open_blob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    pub content_type: String,
    pub size: u64,
}

/// A tagged image. `tags` is a set: no duplicates, no empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: RecordId,
    pub original_name: String,
    pub tags: BTreeSet<String>,
    pub blob_ref: BlobId,
    pub cached_hash: Option<String>,
}

impl ImageRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Tags joined by single spaces, in sorted order.
    pub fn tags_string(&self) -> String {
        self.tags.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }

    /// True when the record carries exactly the sentinel delete tag.
    pub fn is_soft_deleted(&self) -> bool {
        self.tags.len() == 1 && self.has_tag(DELETE_TAG)
    }
}

/// A record awaiting insertion; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewImageRecord {
    pub original_name: String,
    pub tags: Vec<String>,
    pub blob_ref: BlobId,
}

impl NewImageRecord {
    pub fn new(original_name: impl Into<String>, blob_ref: BlobId) -> Self {
        Self {
            original_name: original_name.into(),
            tags: Vec::new(),
            blob_ref,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Usage count for one tag. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub name: String,
    pub count: u64,
}

/// Collapse a tag list into a set, dropping empty entries.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter(|t| !t.as_ref().is_empty())
        .map(|t| t.as_ref().to_string())
        .collect()
}

/// Split a space-separated tag list, dropping empty tokens.
pub fn tags_from_string(s: &str) -> Vec<String> {
    s.split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), ID_LEN);
        assert_eq!(RecordId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn test_generated_ids_sort_in_creation_order() {
        let ids: Vec<BlobId> = (0..50).map(|_| BlobId::generate()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for raw in ["", "abc", "zzzzzzzzzzzzzzzzzzzzzzzz", "0123456789abcdef012345678"] {
            let err = RecordId::parse(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{raw:?}");
        }
    }

    #[test]
    fn test_parse_normalises_case() {
        let id = RecordId::parse("0123456789ABCDEF01234567").unwrap();
        assert_eq!(id.as_str(), "0123456789abcdef01234567");
    }

    #[test]
    fn test_tags_from_string_collapses_spaces() {
        assert_eq!(tags_from_string("  cat   fun "), vec!["cat", "fun"]);
        assert!(tags_from_string("   ").is_empty());
    }

    #[test]
    fn test_normalize_tags_dedups_and_drops_empty() {
        let tags = normalize_tags(["x", "", "x", "y"]);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_soft_deleted_requires_only_the_sentinel() {
        let mut record = ImageRecord {
            id: RecordId::generate(),
            original_name: "cat.png".to_string(),
            tags: normalize_tags([DELETE_TAG]),
            blob_ref: BlobId::generate(),
            cached_hash: None,
        };
        assert!(record.is_soft_deleted());

        record.tags.insert("cat".to_string());
        assert!(!record.is_soft_deleted());
        assert_eq!(record.tags_string(), "_delete cat");
    }
}
