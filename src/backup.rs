//! Whole-store snapshots for manual backup and restore.
//!
//! A snapshot is a JSON object keyed by table name, each entry carrying the
//! column list, the rows and a row count. A table that cannot be read is
//! kept in the snapshot with its error instead of failing the export.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock;
use crate::error::{Result, StorageError};
use crate::storage::traits::LocalStore;
use crate::types::{Filter, Record};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    pub columns: Vec<String>,
    #[serde(rename = "data")]
    pub rows: Vec<Record>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub created_at: String,
    pub tables: BTreeMap<String, TableDump>,
}

impl Snapshot {
    /// Rows across every readable table.
    pub fn total_rows(&self) -> usize {
        self.tables
            .values()
            .filter(|t| t.error.is_none())
            .map(|t| t.count)
            .sum()
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StorageError::Serialize(e.to_string()).into())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StorageError::Serialize(e.to_string()).into())
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(StorageError::Io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| StorageError::Serialize(e.to_string()).into())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(StorageError::Io)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StorageError::Serialize(e.to_string()).into())
    }
}

/// Dump every data table of `store`.
pub fn export_snapshot<L: LocalStore>(store: &L) -> Result<Snapshot> {
    let mut tables = BTreeMap::new();
    for table in store.table_names()? {
        let dump = match dump_table(store, &table) {
            Ok(dump) => dump,
            Err(e) => {
                warn!(table = %table, error = %e, "failed to export table");
                TableDump {
                    error: Some(e.to_string()),
                    ..TableDump::default()
                }
            }
        };
        tables.insert(table, dump);
    }
    let snapshot = Snapshot {
        created_at: clock::now_string(),
        tables,
    };
    info!(
        tables = snapshot.tables.len(),
        rows = snapshot.total_rows(),
        "exported snapshot"
    );
    Ok(snapshot)
}

fn dump_table<L: LocalStore>(store: &L, table: &str) -> Result<TableDump> {
    let columns = store
        .raw_columns(table)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let rows = store.query(table, &Filter::All)?;
    Ok(TableDump {
        columns,
        count: rows.len(),
        rows,
        error: None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    /// Rows that could not be written (unknown table, missing id, ...).
    pub skipped: usize,
}

/// Replay a snapshot with insert-or-replace. Rows that fail are counted and
/// skipped.
pub fn restore_snapshot<L: LocalStore>(store: &L, snapshot: &Snapshot) -> RestoreReport {
    let mut report = RestoreReport::default();
    for (table, dump) in &snapshot.tables {
        for row in &dump.rows {
            match store.transaction(|s| s.insert_or_replace(table, row)) {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!(table = %table, id = row.id(), error = %e, "skipped snapshot row");
                    report.skipped += 1;
                }
            }
        }
    }
    info!(restored = report.restored, skipped = report.skipped, "restored snapshot");
    report
}
