//! Last-writer-wins merge planning.
//!
//! The plan for one table is computed from both full snapshots before any
//! write happens. The strictly later `updated_at` wins; equal clocks move
//! nothing. A side without a parsable clock loses to one with a clock.

use std::collections::{BTreeMap, HashSet};

use crate::clock;
use crate::naming;
use crate::storage::traits::RemoteDocument;
use crate::types::{Record, SCHEMA_SENTINEL_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Upload,
    Download,
    SkipEqual,
    SkipPending,
}

/// Decide what to do with one id.
pub fn decide(local: Option<&Record>, remote: Option<&Record>, pending: bool) -> Option<MergeAction> {
    if pending {
        return Some(MergeAction::SkipPending);
    }
    match (local, remote) {
        (None, None) => None,
        (Some(_), None) => Some(MergeAction::Upload),
        (None, Some(_)) => Some(MergeAction::Download),
        (Some(l), Some(r)) => {
            let lt = l.get("updated_at").and_then(clock::parse_timestamp);
            let rt = r.get("updated_at").and_then(clock::parse_timestamp);
            Some(match lt.cmp(&rt) {
                std::cmp::Ordering::Greater => MergeAction::Upload,
                std::cmp::Ordering::Less => MergeAction::Download,
                std::cmp::Ordering::Equal => MergeAction::SkipEqual,
            })
        }
    }
}

/// Convert a remote document into a local record. The document key wins
/// over any `id` field in the body.
pub fn to_local_record(doc: &RemoteDocument) -> Record {
    let mut record = Record::from_map(naming::to_local(&doc.data));
    record.set("id", doc.id.as_str());
    record
}

/// Convert a local record into a remote document body.
pub fn to_remote_fields(record: &Record) -> serde_json::Map<String, serde_json::Value> {
    naming::to_remote(record.fields())
}

/// Writes needed to converge one table.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub uploads: Vec<Record>,
    pub downloads: Vec<Record>,
    pub skipped_equal: Vec<String>,
    pub skipped_pending: Vec<String>,
}

impl MergePlan {
    /// Plan over the union of ids. Schema sentinels and id-less rows are
    /// ignored. Ids are visited in sorted order.
    pub fn build(local: Vec<Record>, remote: &[RemoteDocument], pending: &HashSet<String>) -> Self {
        let mut sides: BTreeMap<String, (Option<Record>, Option<Record>)> = BTreeMap::new();
        for record in local {
            if record.id().is_empty() {
                continue;
            }
            let id = record.id().to_string();
            sides.entry(id).or_default().0 = Some(record);
        }
        for doc in remote {
            if doc.id.is_empty() || doc.id == SCHEMA_SENTINEL_ID {
                continue;
            }
            sides.entry(doc.id.clone()).or_default().1 = Some(to_local_record(doc));
        }

        let mut plan = MergePlan::default();
        for (id, (l, r)) in sides {
            match decide(l.as_ref(), r.as_ref(), pending.contains(&id)) {
                Some(MergeAction::Upload) => plan.uploads.extend(l),
                Some(MergeAction::Download) => plan.downloads.extend(r),
                Some(MergeAction::SkipEqual) => plan.skipped_equal.push(id),
                Some(MergeAction::SkipPending) => plan.skipped_pending.push(id),
                None => {}
            }
        }
        plan
    }
}
