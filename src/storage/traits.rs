//! Store traits consumed by the reconciliation core.
//!
//! `LocalStore` is the device-of-record relational store; `RemoteStore` is
//! the tenant-scoped document store shared by every device. `TenantResolver`
//! supplies the active tenant.
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::error::{RemoteError, Result};
use crate::types::{ColumnInfo, Filter, Record};

// ============================================================================
// LocalStore
// ============================================================================

/// Typed access to the on-device relational store.
///
/// Implementors must be `Send + Sync` so the engines can share them across
/// tasks. All methods are synchronous; callers in async contexts block the
/// current thread for the duration of each call.
pub trait LocalStore: Send + Sync {
    /// Rows of `table` matching `filter`.
    fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Record>>;

    /// Insert `record`, replacing any row with the same id.
    fn insert_or_replace(&self, table: &str, record: &Record) -> Result<()>;

    /// Delete rows matching `filter`. Returns the number deleted.
    fn delete_where(&self, table: &str, filter: &Filter) -> Result<usize>;

    /// Execute a closure inside a store transaction. An `Err` from the
    /// closure rolls back everything it wrote.
    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>;

    /// Declared column layout of `table`.
    fn raw_columns(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// User-visible data tables, excluding internal bookkeeping tables.
    fn table_names(&self) -> Result<Vec<String>>;

    /// Read a metadata key-value pair (checkpoints, markers).
    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Write a metadata key-value pair.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Number of rows of `table` matching `filter`.
    fn count(&self, table: &str, filter: &Filter) -> Result<usize> {
        Ok(self.query(table, filter)?.len())
    }
}

// ============================================================================
// RemoteStore
// ============================================================================

/// A document in a remote collection. `data` uses the remote (camelCase)
/// field convention and may or may not repeat the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub data: Map<String, Value>,
}

/// Kind of a remote change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A change observed on a remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub tenant: String,
    pub table: String,
    pub document: RemoteDocument,
}

/// Tenant-scoped remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap reachability check. Callers bound it with a timeout.
    async fn probe(&self) -> std::result::Result<(), RemoteError>;

    /// Every document of a tenant's collection.
    async fn get_collection(
        &self,
        tenant: &str,
        table: &str,
    ) -> std::result::Result<Vec<RemoteDocument>, RemoteError>;

    /// Write a document. With `merge`, fields are upserted into the existing
    /// document; without, the document is replaced.
    async fn set_document(
        &self,
        tenant: &str,
        table: &str,
        id: &str,
        data: &Map<String, Value>,
        merge: bool,
    ) -> std::result::Result<(), RemoteError>;

    async fn delete_document(
        &self,
        tenant: &str,
        table: &str,
        id: &str,
    ) -> std::result::Result<(), RemoteError>;

    /// Delete `ids` in one atomic commit. Implementations may reject batches
    /// above their store-imposed limit with `RemoteErrorKind::BatchTooLarge`.
    async fn batched_delete(
        &self,
        tenant: &str,
        table: &str,
        ids: &[String],
    ) -> std::result::Result<(), RemoteError>;

    /// Subscribe to change events, when the store can push them. The
    /// receiver may carry events for other collections; consumers filter on
    /// `tenant` and `table`. Poll-only stores keep the default.
    fn subscribe(&self, _tenant: &str, _table: &str) -> Option<broadcast::Receiver<RemoteChange>> {
        None
    }
}

/// Run one remote call with an upper bound. An elapsed bound becomes a
/// [`RemoteErrorKind::Timeout`](crate::error::RemoteErrorKind::Timeout)
/// error, which callers treat as offline.
pub async fn bounded<T, F>(limit: Duration, operation: &str, call: F) -> std::result::Result<T, RemoteError>
where
    F: Future<Output = std::result::Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::timeout(format!(
            "{operation} timed out after {}s",
            limit.as_secs()
        ))),
    }
}

// ============================================================================
// TenantResolver
// ============================================================================

/// Resolves the tenant whose data the engines operate on.
pub trait TenantResolver: Send + Sync {
    fn current_tenant(&self) -> Option<String>;
}

/// A fixed tenant, or none (signed out).
#[derive(Debug, Clone)]
pub struct StaticTenant(pub Option<String>);

impl StaticTenant {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self(Some(tenant.into()))
    }
}

impl TenantResolver for StaticTenant {
    fn current_tenant(&self) -> Option<String> {
        self.0.clone()
    }
}
