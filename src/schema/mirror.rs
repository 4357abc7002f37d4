//! Schema Mirror: publish the local column layout to the remote store.
//!
//! Each remote collection gets a descriptor document under
//! [`SCHEMA_SENTINEL_ID`]. Writing it replaces the previous descriptor and
//! never touches data documents. Mirroring is advisory: callers log the
//! error and carry on.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::clock;
use crate::config::DEFAULT_REMOTE_TIMEOUT_SECS;
use crate::error::{PosSyncError, SchemaError, StorageError};
use crate::naming;
use crate::storage::traits::{bounded, LocalStore, RemoteStore};
use crate::types::SCHEMA_SENTINEL_ID;

pub struct SchemaMirror<L: LocalStore> {
    local: Arc<L>,
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl<L: LocalStore> SchemaMirror<L> {
    pub fn new(local: Arc<L>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
        }
    }

    /// Bound each descriptor write.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Descriptor document for one local table.
    pub fn describe(&self, table: &str) -> Result<Map<String, Value>, SchemaError> {
        let columns = self.local.raw_columns(table).map_err(local_error)?;
        let mut mapping = Map::new();
        let mut primary_key = Vec::new();
        for column in &columns {
            let remote_name = naming::snake_to_camel(&column.name);
            if column.primary_key {
                primary_key.push(Value::String(remote_name.clone()));
            }
            mapping.insert(remote_name, Value::String(column.data_type.to_lowercase()));
        }
        let descriptor = json!({
            "tableName": table,
            "columns": mapping,
            "primaryKey": primary_key,
            "generatedAt": clock::now_string(),
        });
        match descriptor {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    /// Write a descriptor for every local table. All tables are attempted;
    /// the first failure is returned afterwards.
    pub async fn materialize(&self, tenant: &str) -> Result<(), SchemaError> {
        let tables = self.local.table_names().map_err(local_error)?;
        let mut first_error = None;
        for table in tables {
            let result = match self.describe(&table) {
                Ok(descriptor) => bounded(
                    self.timeout,
                    "schema descriptor write",
                    self.remote
                        .set_document(tenant, &table, SCHEMA_SENTINEL_ID, &descriptor, false),
                )
                .await
                .map_err(|source| SchemaError::Remote {
                        table: table.clone(),
                        source,
                    }),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!(tenant, table = %table, "mirrored schema descriptor"),
                Err(e) => {
                    warn!(tenant, table = %table, error = %e, "schema mirror failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn local_error(e: PosSyncError) -> SchemaError {
    match e {
        PosSyncError::Storage(storage) => SchemaError::Local(storage),
        other => SchemaError::Local(StorageError::Transaction {
            message: other.to_string(),
            source: None,
        }),
    }
}
