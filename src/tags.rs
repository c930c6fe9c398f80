//! Tag usage counts and bulk rename.

use std::collections::BTreeMap;

use tracing::info;

use crate::db::MetadataStore;
use crate::error::{Result, StoreError};
use crate::model::{ImageRecord, TagInfo};

/// Count how many of `records` carry each tag, sorted by tag name.
pub fn aggregate(records: &[ImageRecord]) -> Vec<TagInfo> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for tag in records.iter().flat_map(|r| r.tags.iter()) {
        *counts.entry(tag.as_str()).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|(name, count)| TagInfo {
            name: name.to_string(),
            count,
        })
        .collect()
}

/// Replace `from` with `to` on every record in `records` that carries it.
///
/// Returns the number of records rewritten. Records already tagged `to`
/// simply lose `from`.
pub fn rename_tag(
    store: &dyn MetadataStore,
    records: &[ImageRecord],
    from: &str,
    to: &str,
) -> Result<usize> {
    const OP: &str = "rename_tag";

    if from.trim().is_empty() || to.trim().is_empty() {
        return Err(StoreError::invalid(OP, "tag names must not be empty"));
    }
    if from.contains(' ') || to.contains(' ') {
        return Err(StoreError::invalid(OP, "tag names must not contain spaces"));
    }
    if from == to {
        return Ok(0);
    }

    let mut renamed = 0;
    for record in records.iter().filter(|r| r.has_tag(from)) {
        let tags: Vec<String> = record
            .tags
            .iter()
            .filter(|t| t.as_str() != from)
            .cloned()
            .chain(std::iter::once(to.to_string()))
            .collect();
        store.replace_tags(&record.id, &tags)?;
        renamed += 1;
    }

    info!(from, to, renamed, "Renamed tag");
    Ok(renamed)
}
