//! Queue of local deletions that still have to reach the remote store.
//!
//! Repair operations enqueue inside the same local transaction as the delete,
//! so a crash can never drop the remote half of a repair. Entries are cleared
//! only after the remote batch containing them commits.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::clock;
use crate::error::Result;
use crate::types::{Filter, Record};

use super::traits::LocalStore;
use super::TOMBSTONE_TABLE;

fn key(table: &str, id: &str) -> String {
    format!("{table}/{id}")
}

/// Queue `ids` of `table` for remote deletion.
pub fn enqueue<L: LocalStore>(store: &L, table: &str, ids: &[String]) -> Result<()> {
    let queued_at = clock::now_string();
    for id in ids {
        let entry = Record::new(key(table, id))
            .with("table_name", table)
            .with("record_id", id.as_str())
            .with("queued_at", queued_at.as_str());
        store.insert_or_replace(TOMBSTONE_TABLE, &entry)?;
    }
    Ok(())
}

/// Queued ids for one table, oldest first.
pub fn pending<L: LocalStore>(store: &L, table: &str) -> Result<Vec<String>> {
    Ok(store
        .query(TOMBSTONE_TABLE, &Filter::eq("table_name", table))?
        .iter()
        .filter_map(|r| r.get_str("record_id").map(str::to_string))
        .collect())
}

/// Same as [`pending`], as a set for membership checks.
pub fn pending_set<L: LocalStore>(store: &L, table: &str) -> Result<HashSet<String>> {
    Ok(pending(store, table)?.into_iter().collect())
}

/// Every queued id grouped by table.
pub fn all_pending<L: LocalStore>(store: &L) -> Result<BTreeMap<String, Vec<String>>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in store.query(TOMBSTONE_TABLE, &Filter::All)? {
        if let (Some(table), Some(id)) = (entry.get_str("table_name"), entry.get_str("record_id")) {
            out.entry(table.to_string()).or_default().push(id.to_string());
        }
    }
    Ok(out)
}

/// Drop queue entries once their remote deletion committed.
pub fn clear<L: LocalStore>(store: &L, table: &str, ids: &[String]) -> Result<usize> {
    let keys: Vec<Value> = ids.iter().map(|id| Value::String(key(table, id))).collect();
    store.delete_where(TOMBSTONE_TABLE, &Filter::In("id".to_string(), keys))
}
