//! SQLite local store.
//!
//! Implements `LocalStore` using rusqlite (bundled). The connection is
//! protected by a `parking_lot::ReentrantMutex<RefCell<Connection>>` so that
//! `transaction()` can hold the lock while calling the closure, which also
//! needs to lock in order to execute SQL.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::params;
use rusqlite::types::ValueRef;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::error::{PosSyncError, Result, StorageError};
use crate::types::{ColumnInfo, Filter, Record};

use super::traits::LocalStore;
use super::{META_TABLE, TOMBSTONE_TABLE};

const INTERNAL_TABLES: [&str; 2] = [META_TABLE, TOMBSTONE_TABLE];

/// Savepoint names must be unique across every thread sharing a connection.
static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id              TEXT PRIMARY KEY,
    order_number    TEXT,
    status          TEXT,
    type            TEXT,
    table_id        TEXT,
    user_id         TEXT,
    customer_name   TEXT,
    subtotal        REAL,
    tax_amount      REAL,
    tip_amount      REAL,
    discount_amount REAL,
    total_amount    REAL NOT NULL DEFAULT 0,
    payment_status  TEXT,
    notes           TEXT,
    order_time      TEXT,
    created_at      TEXT,
    updated_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_orders_order_number ON orders(order_number);

CREATE TABLE IF NOT EXISTS order_items (
    id                   TEXT PRIMARY KEY,
    order_id             TEXT,
    menu_item_id         TEXT,
    quantity             INTEGER NOT NULL DEFAULT 1,
    unit_price           REAL NOT NULL DEFAULT 0,
    total_price          REAL,
    special_instructions TEXT,
    status               TEXT,
    created_at           TEXT,
    updated_at           TEXT
);
CREATE INDEX IF NOT EXISTS idx_order_items_order_id ON order_items(order_id);

CREATE TABLE IF NOT EXISTS menu_items (
    id           TEXT PRIMARY KEY,
    name         TEXT,
    description  TEXT,
    price        REAL,
    category_id  TEXT,
    is_available INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT,
    updated_at   TEXT
);

CREATE TABLE IF NOT EXISTS categories (
    id          TEXT PRIMARY KEY,
    name        TEXT,
    description TEXT,
    color       TEXT,
    icon        TEXT,
    sort_order  INTEGER NOT NULL DEFAULT 0,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT,
    updated_at  TEXT
);

CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY,
    name       TEXT,
    role       TEXT,
    pin        TEXT,
    is_active  INTEGER NOT NULL DEFAULT 1,
    created_at TEXT,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS printer_configs (
    id           TEXT PRIMARY KEY,
    name         TEXT,
    printer_type TEXT,
    ip_address   TEXT,
    port         INTEGER,
    is_default   INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT,
    updated_at   TEXT
);

CREATE TABLE IF NOT EXISTS sync_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_tombstones (
    id         TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    record_id  TEXT NOT NULL,
    queued_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_tombstones_table ON sync_tombstones(table_name);
";

// ============================================================================
// Value helpers
// ============================================================================

/// Convert a `serde_json::Value` to a `rusqlite::types::Value` for binding.
fn json_value_to_sql(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        // Arrays and objects stored as JSON strings in SQLite
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn sql_to_json_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|x| Value::Number((*x).into())).collect()),
    }
}

fn storage_err(e: rusqlite::Error) -> PosSyncError {
    PosSyncError::Storage(StorageError::Sqlite(e))
}

/// Identifiers are interpolated into SQL, so only plain names pass.
fn check_ident(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidColumn(name.to_string()).into())
    }
}

/// Render `filter` as a SQL condition, appending bound parameters.
fn filter_sql(filter: &Filter, params: &mut Vec<rusqlite::types::Value>) -> Result<String> {
    Ok(match filter {
        Filter::All => "1 = 1".to_string(),
        Filter::Eq(col, Value::Null) | Filter::IsNull(col) => {
            format!("\"{}\" IS NULL", check_ident(col)?)
        }
        Filter::Eq(col, v) => {
            params.push(json_value_to_sql(v));
            format!("\"{}\" = ?", check_ident(col)?)
        }
        Filter::In(_, vs) if vs.is_empty() => "1 = 0".to_string(),
        Filter::In(col, vs) => {
            let placeholders = vs.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            params.extend(vs.iter().map(json_value_to_sql));
            format!("\"{}\" IN ({})", check_ident(col)?, placeholders)
        }
        Filter::And(fs) if fs.is_empty() => "1 = 1".to_string(),
        Filter::And(fs) => {
            let parts = fs
                .iter()
                .map(|f| filter_sql(f, params).map(|s| format!("({s})")))
                .collect::<Result<Vec<_>>>()?;
            parts.join(" AND ")
        }
    })
}

// ============================================================================
// SqliteStore
// ============================================================================

/// SQLite local store.
///
/// `ReentrantMutex` allows `transaction()` to hold the guard while the closure
/// re-acquires it for individual SQL operations.
pub struct SqliteStore {
    conn: ReentrantMutex<RefCell<rusqlite::Connection>>,
    columns: Mutex<HashMap<String, Vec<ColumnInfo>>>,
    initialized: bool,
}

impl SqliteStore {
    /// Open a file-backed SQLite database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(storage_err)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage_err)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: ReentrantMutex::new(RefCell::new(conn)),
            columns: Mutex::new(HashMap::new()),
            initialized: false,
        }
    }

    /// Create the POS tables and pragmas. Safe to call on an existing database.
    pub fn initialize(&mut self) -> Result<()> {
        {
            let guard = self.conn.lock();
            let conn = guard.borrow();
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(storage_err)?;
            conn.execute_batch(SCHEMA_SQL).map_err(storage_err)?;
        }
        self.columns.lock().clear();
        self.initialized = true;
        Ok(())
    }

    /// Returns whether `initialize()` has been called.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Execute raw SQL (migrations, test fixtures that bypass the typed API).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql))?;
        self.columns.lock().clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Execute `f` with a shared reference to the underlying connection.
    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        f(&*conn).map_err(storage_err)
    }

    fn load_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        if let Some(cols) = self.columns.lock().get(table) {
            return Ok(cols.clone());
        }
        let table = check_ident(table)?;
        let cols = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
            let rows = stmt.query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    data_type: row.get::<_, String>(2)?.to_uppercase(),
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        if cols.is_empty() {
            return Err(StorageError::UnknownTable(table.to_string()).into());
        }
        self.columns.lock().insert(table.to_string(), cols.clone());
        Ok(cols)
    }

    fn row_to_record(row: &rusqlite::Row<'_>, names: &[String]) -> rusqlite::Result<Record> {
        let mut fields = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            fields.insert(name.clone(), sql_to_json_value(row.get_ref(i)?));
        }
        Ok(Record::from_map(fields))
    }
}

// ============================================================================
// LocalStore implementation
// ============================================================================

impl LocalStore for SqliteStore {
    fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        let cols = self.load_columns(table)?;
        let names: Vec<String> = cols.into_iter().map(|c| c.name).collect();
        let mut params = Vec::new();
        let condition = filter_sql(filter, &mut params)?;
        let select = names
            .iter()
            .map(|n| format!("\"{n}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select} FROM \"{table}\" WHERE {condition} ORDER BY rowid");

        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn.prepare_cached(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Self::row_to_record(row, &names)
            })
            .map_err(storage_err)?;
        let records: rusqlite::Result<Vec<_>> = rows.collect();
        records.map_err(storage_err)
    }

    fn insert_or_replace(&self, table: &str, record: &Record) -> Result<()> {
        if record.id().is_empty() {
            return Err(StorageError::MissingId {
                table: table.to_string(),
            }
            .into());
        }
        let cols = self.load_columns(table)?;
        let mut names = Vec::new();
        let mut values = Vec::new();
        for col in &cols {
            if let Some(v) = record.get(&col.name) {
                names.push(format!("\"{}\"", col.name));
                values.push(json_value_to_sql(v));
            }
        }
        let dropped: Vec<&String> = record
            .fields()
            .keys()
            .filter(|k| !cols.iter().any(|c| &c.name == *k))
            .collect();
        if !dropped.is_empty() {
            debug!(table, id = record.id(), ?dropped, "ignoring fields without a local column");
        }

        let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO \"{table}\" ({}) VALUES ({placeholders})",
            names.join(", ")
        );
        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values))
                .map(|_| ())
        })
    }

    fn delete_where(&self, table: &str, filter: &Filter) -> Result<usize> {
        let table = check_ident(table)?;
        self.load_columns(table)?;
        let mut params = Vec::new();
        let condition = filter_sql(filter, &mut params)?;
        let sql = format!("DELETE FROM \"{table}\" WHERE {condition}");
        self.with_conn(|conn| conn.execute(&sql, rusqlite::params_from_iter(params)))
    }

    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        // The guard is held until RELEASE/ROLLBACK so no other thread can
        // interleave statements with this savepoint. The closure re-locks
        // on the same thread, which the reentrant mutex allows.
        let guard = self.conn.lock();
        let sp_name = format!("sp_{}", SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed));
        guard
            .borrow()
            .execute(&format!("SAVEPOINT {sp_name}"), [])
            .map_err(storage_err)?;

        match f(self) {
            Ok(v) => {
                let release = guard
                    .borrow()
                    .execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                match release {
                    Ok(_) => Ok(v),
                    Err(e) => {
                        let conn = guard.borrow();
                        let _ = conn.execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                        let _ = conn.execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                        Err(StorageError::Transaction {
                            message: "RELEASE SAVEPOINT failed".to_string(),
                            source: Some(Box::new(e)),
                        }
                        .into())
                    }
                }
            }
            Err(e) => {
                let conn = guard.borrow();
                let _ = conn.execute(&format!("ROLLBACK TO SAVEPOINT {sp_name}"), []);
                let _ = conn.execute(&format!("RELEASE SAVEPOINT {sp_name}"), []);
                Err(e)
            }
        }
    }

    fn raw_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.load_columns(table)
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let names = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(names
            .into_iter()
            .filter(|n| !INTERNAL_TABLES.contains(&n.as_str()))
            .collect())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let guard = self.conn.lock();
        let conn = guard.borrow();
        let mut stmt = conn
            .prepare_cached("SELECT value FROM sync_meta WHERE key = ?1")
            .map_err(storage_err)?;

        match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<usize> {
        let table = check_ident(table)?;
        self.load_columns(table)?;
        let mut params = Vec::new();
        let condition = filter_sql(filter, &mut params)?;
        let sql = format!("SELECT COUNT(*) FROM \"{table}\" WHERE {condition}");
        self.with_conn(|conn| {
            conn.query_row(&sql, rusqlite::params_from_iter(params), |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        })
    }
}
