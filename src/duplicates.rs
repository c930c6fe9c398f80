//! Exact-duplicate detection and tag merging.
//!
//! Records whose blobs hash identically form a group. Merging a group
//! keeps the record with the lowest id, gives it the union of every
//! member's tags, and retags the rest with the delete tag so a later sweep
//! removes them. Merging overwrites the losers' tags; capture them first if
//! their history matters.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::DuplicatesConfig;
use crate::db::Stores;
use crate::error::{Result, StoreError};
use crate::hashing::content_hash;
use crate::model::{ImageRecord, RecordId};
use crate::query::Predicate;
use crate::tasks::CancelToken;

/// Records sharing one content hash, ordered by id.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub hash: String,
    pub records: Vec<ImageRecord>,
}

impl DuplicateGroup {
    /// The member that survives a merge: the one with the lowest id.
    pub fn survivor(&self) -> Option<&ImageRecord> {
        self.records.iter().min_by(|a, b| a.id.cmp(&b.id))
    }
}

/// What a merge did to one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub survivor: RecordId,
    pub tags: BTreeSet<String>,
    pub retired: Vec<RecordId>,
}

/// Totals for a full merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub groups: usize,
    pub retired: usize,
}

pub struct Deduplicator {
    stores: Stores,
    config: DuplicatesConfig,
}

impl Deduplicator {
    pub fn new(stores: Stores, config: DuplicatesConfig) -> Self {
        Self { stores, config }
    }

    fn is_excluded(&self, record: &ImageRecord) -> bool {
        record.has_tag(&self.config.delete_tag)
            || self.config.exclude_tags.iter().any(|t| record.has_tag(t))
    }

    /// Group `records` by content hash, keeping groups of two or more.
    ///
    /// Records carrying the delete tag or an excluded tag are skipped.
    /// Hashes are computed in parallel; uncached ones are cached as a side
    /// effect. Groups are ordered by their survivor's id.
    pub fn find_groups(
        &self,
        records: Vec<ImageRecord>,
        cancel: &CancelToken,
    ) -> Result<Vec<DuplicateGroup>> {
        const OP: &str = "find_duplicate_groups";

        let hashed: Vec<(String, ImageRecord)> = records
            .into_par_iter()
            .filter(|record| !self.is_excluded(record))
            .map(|record| {
                cancel.check(OP)?;
                let hash = content_hash(&self.stores, &record, cancel)?;
                Ok((hash, record))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut by_hash: BTreeMap<String, Vec<ImageRecord>> = BTreeMap::new();
        for (hash, record) in hashed {
            by_hash.entry(hash).or_default().push(record);
        }

        let mut groups: Vec<DuplicateGroup> = by_hash
            .into_iter()
            .filter(|(_, records)| records.len() > 1)
            .map(|(hash, mut records)| {
                records.sort_by(|a, b| a.id.cmp(&b.id));
                DuplicateGroup { hash, records }
            })
            .collect();
        groups.sort_by(|a, b| a.records[0].id.cmp(&b.records[0].id));

        debug!(groups = groups.len(), "Duplicate groups found");
        Ok(groups)
    }

    /// Merge one group: union of tags onto the lowest id, delete tag on the rest.
    pub fn merge_group(&self, group: &DuplicateGroup) -> Result<MergeOutcome> {
        const OP: &str = "merge_group";

        let survivor = group
            .survivor()
            .ok_or_else(|| StoreError::invalid(OP, "duplicate group is empty"))?;
        if group.records.len() < 2 {
            return Err(StoreError::invalid(
                OP,
                format!("duplicate group {} has a single record", group.hash),
            ));
        }

        let tags: BTreeSet<String> = group
            .records
            .iter()
            .flat_map(|r| r.tags.iter().cloned())
            .collect();
        let union: Vec<String> = tags.iter().cloned().collect();
        self.stores.records().replace_tags(&survivor.id, &union)?;

        let delete_tag = vec![self.config.delete_tag.clone()];
        let mut retired = Vec::with_capacity(group.records.len() - 1);
        for record in group.records.iter().filter(|r| r.id != survivor.id) {
            self.stores.records().replace_tags(&record.id, &delete_tag)?;
            retired.push(record.id.clone());
        }

        info!(
            hash = %group.hash,
            survivor = %survivor.id,
            retired = retired.len(),
            tags = %union.join(" "),
            "Merged duplicate group"
        );

        Ok(MergeOutcome {
            survivor: survivor.id.clone(),
            tags,
            retired,
        })
    }

    /// Merge every group, one pass at a time per store handle.
    ///
    /// Cancellation is checked between groups; groups merged before the
    /// cancellation stay merged.
    pub fn merge_all(&self, groups: &[DuplicateGroup], cancel: &CancelToken) -> Result<MergeReport> {
        const OP: &str = "merge_all";

        let _guard = self.stores.lock_merges(OP)?;
        let mut report = MergeReport::default();
        for group in groups {
            cancel.check(OP)?;
            let outcome = self.merge_group(group)?;
            report.groups += 1;
            report.retired += outcome.retired.len();
        }
        Ok(report)
    }

    /// Find and merge every duplicate group among all stored records.
    pub fn run(&self, cancel: &CancelToken) -> Result<MergeReport> {
        let records = self.stores.records().find(&Predicate::All)?;
        info!(records = records.len(), "Looking for duplicates");
        let groups = self.find_groups(records, cancel)?;
        info!(groups = groups.len(), "Found duplicated images");
        self.merge_all(&groups, cancel)
    }
}
