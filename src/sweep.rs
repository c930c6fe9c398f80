//! Hard removal of records carrying a tag, conventionally `_delete`.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::db::Stores;
use crate::error::{Result, StoreError};
use crate::model::BlobId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records removed.
    pub records: usize,
    /// Blobs reaped after their last referencing record went away.
    pub blobs: usize,
}

/// Remove every record tagged `tag`.
///
/// With `reap_blobs`, the blobs those records pointed at are deleted too,
/// unless another record still references them. A blob that fails to delete
/// is logged and left in place. Fails with `NotFound` when no record
/// carries the tag.
pub fn sweep(stores: &Stores, tag: &str, reap_blobs: bool) -> Result<SweepReport> {
    const OP: &str = "sweep";

    if tag.is_empty() {
        return Err(StoreError::invalid(OP, "sweep tag must not be empty"));
    }

    let removed = stores.records().remove_tagged(tag)?;
    if removed.is_empty() {
        return Err(StoreError::not_found(OP, "records tagged", tag));
    }

    let mut report = SweepReport {
        records: removed.len(),
        blobs: 0,
    };

    if reap_blobs {
        let candidates: BTreeSet<&BlobId> = removed.iter().map(|r| &r.blob_ref).collect();
        for blob in candidates {
            if stores.records().is_blob_referenced(blob)? {
                continue;
            }
            match stores.blobs().delete_blob(blob) {
                Ok(true) => report.blobs += 1,
                Ok(false) => {}
                Err(e) => warn!(blob_id = %blob, error = %e, "Failed to reap blob"),
            }
        }
    }

    info!(tag, records = report.records, blobs = report.blobs, "Sweep finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BlobLimits;
    use crate::error::ErrorKind;
    use crate::ingest::ingest;
    use crate::model::{ImageRecord, DELETE_TAG};
    use crate::tasks::CancelToken;
    use std::io::Cursor;

    fn add_image(stores: &Stores, content: &[u8], tags: &[&str]) -> ImageRecord {
        ingest(
            stores,
            &mut Cursor::new(content.to_vec()),
            "upload",
            tags,
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_sweep_removes_tagged_records_and_reaps_blobs() {
        let stores = Stores::in_memory(BlobLimits::default());
        let keep = add_image(&stores, b"keep", &["cat"]);
        let doomed = add_image(&stores, b"doomed", &[DELETE_TAG]);

        let report = sweep(&stores, DELETE_TAG, true).unwrap();
        assert_eq!(report, SweepReport { records: 1, blobs: 1 });

        assert_eq!(stores.records().count().unwrap(), 1);
        assert!(stores.records().find_by_id(&keep.id).is_ok());
        let err = stores.blobs().blob_info(&doomed.blob_ref).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_sweep_without_reaping_keeps_blobs() {
        let stores = Stores::in_memory(BlobLimits::default());
        let doomed = add_image(&stores, b"doomed", &[DELETE_TAG]);

        let report = sweep(&stores, DELETE_TAG, false).unwrap();
        assert_eq!(report, SweepReport { records: 1, blobs: 0 });
        assert!(stores.blobs().blob_info(&doomed.blob_ref).is_ok());
    }

    #[test]
    fn test_sweep_with_no_matches_is_not_found() {
        let stores = Stores::in_memory(BlobLimits::default());
        add_image(&stores, b"keep", &["cat"]);

        let err = sweep(&stores, DELETE_TAG, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(stores.records().count().unwrap(), 1);
    }

    #[test]
    fn test_sweep_any_tag() {
        let stores = Stores::in_memory(BlobLimits::default());
        add_image(&stores, b"one", &["old", "cat"]);
        add_image(&stores, b"two", &["old"]);
        add_image(&stores, b"three", &["new"]);

        let report = sweep(&stores, "old", true).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(stores.records().count().unwrap(), 1);
    }

    #[test]
    fn test_sweep_rejects_empty_tag() {
        let stores = Stores::in_memory(BlobLimits::default());
        let err = sweep(&stores, "", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
