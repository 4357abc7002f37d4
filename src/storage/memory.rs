//! In-process remote document store.
//!
//! `MemoryRemote` satisfies the `RemoteStore` contract with per-tenant
//! collections held in memory. It enforces the same 500-operation batch
//! limit as hosted document stores, can be switched offline, and publishes
//! change events on a broadcast channel. Hosts use it for local development
//! and demos; the test suites use it as the remote side.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::config::MAX_REMOTE_BATCH;
use crate::error::{RemoteError, RemoteErrorKind};

use super::traits::{ChangeKind, RemoteChange, RemoteDocument, RemoteStore};

type CollectionKey = (String, String);

pub struct MemoryRemote {
    collections: Mutex<HashMap<CollectionKey, BTreeMap<String, Map<String, Value>>>>,
    online: AtomicBool,
    batch_limit: usize,
    /// Number of successful batched-delete commits.
    batch_commits: AtomicUsize,
    /// Number of successful single-document writes.
    writes: AtomicUsize,
    /// Fail the next N batched deletes with `Unreachable` (after committing
    /// none of their operations).
    fail_batches: AtomicUsize,
    changes: broadcast::Sender<RemoteChange>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            collections: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            batch_limit: MAX_REMOTE_BATCH,
            batch_commits: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_batches: AtomicUsize::new(0),
            changes,
        }
    }

    /// Override the per-commit operation limit.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn fail_next_batches(&self, n: usize) {
        self.fail_batches.store(n, Ordering::SeqCst);
    }

    pub fn batch_commits(&self) -> usize {
        self.batch_commits.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a document directly, bypassing connectivity and change events.
    pub fn insert(&self, tenant: &str, table: &str, id: &str, data: Value) {
        let data = match data {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        self.collections
            .lock()
            .entry((tenant.to_string(), table.to_string()))
            .or_default()
            .insert(id.to_string(), data);
    }

    /// Snapshot of one document.
    pub fn document(&self, tenant: &str, table: &str, id: &str) -> Option<Map<String, Value>> {
        self.collections
            .lock()
            .get(&(tenant.to_string(), table.to_string()))
            .and_then(|c| c.get(id).cloned())
    }

    /// Number of documents in a collection (sentinels included).
    pub fn len(&self, tenant: &str, table: &str) -> usize {
        self.collections
            .lock()
            .get(&(tenant.to_string(), table.to_string()))
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, tenant: &str, table: &str) -> bool {
        self.len(tenant, table) == 0
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(RemoteError::unreachable("remote store is offline"))
        }
    }

    fn publish(&self, kind: ChangeKind, tenant: &str, table: &str, id: &str, data: Map<String, Value>) {
        // No receivers is fine.
        let _ = self.changes.send(RemoteChange {
            kind,
            tenant: tenant.to_string(),
            table: table.to_string(),
            document: RemoteDocument {
                id: id.to_string(),
                data,
            },
        });
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn probe(&self) -> Result<(), RemoteError> {
        self.check_online()
    }

    async fn get_collection(
        &self,
        tenant: &str,
        table: &str,
    ) -> Result<Vec<RemoteDocument>, RemoteError> {
        self.check_online()?;
        let collections = self.collections.lock();
        Ok(collections
            .get(&(tenant.to_string(), table.to_string()))
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| RemoteDocument {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_document(
        &self,
        tenant: &str,
        table: &str,
        id: &str,
        data: &Map<String, Value>,
        merge: bool,
    ) -> Result<(), RemoteError> {
        self.check_online()?;
        let (kind, stored) = {
            let mut collections = self.collections.lock();
            let docs = collections
                .entry((tenant.to_string(), table.to_string()))
                .or_default();
            let kind = if docs.contains_key(id) {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            };
            let doc = docs.entry(id.to_string()).or_default();
            if !merge {
                doc.clear();
            }
            for (k, v) in data {
                doc.insert(k.clone(), v.clone());
            }
            (kind, doc.clone())
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(kind, tenant, table, id, stored);
        Ok(())
    }

    async fn delete_document(&self, tenant: &str, table: &str, id: &str) -> Result<(), RemoteError> {
        self.check_online()?;
        let removed = self
            .collections
            .lock()
            .get_mut(&(tenant.to_string(), table.to_string()))
            .and_then(|docs| docs.remove(id));
        if let Some(data) = removed {
            self.publish(ChangeKind::Removed, tenant, table, id, data);
        }
        Ok(())
    }

    async fn batched_delete(
        &self,
        tenant: &str,
        table: &str,
        ids: &[String],
    ) -> Result<(), RemoteError> {
        self.check_online()?;
        if ids.len() > self.batch_limit {
            return Err(RemoteError::new(
                format!(
                    "batch of {} operations exceeds limit of {}",
                    ids.len(),
                    self.batch_limit
                ),
                RemoteErrorKind::BatchTooLarge,
            ));
        }
        let fail = self
            .fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(RemoteError::unreachable("connection dropped during commit"));
        }

        let removed: Vec<(String, Map<String, Value>)> = {
            let mut collections = self.collections.lock();
            match collections.get_mut(&(tenant.to_string(), table.to_string())) {
                Some(docs) => ids
                    .iter()
                    .filter_map(|id| docs.remove(id).map(|d| (id.clone(), d)))
                    .collect(),
                None => Vec::new(),
            }
        };
        self.batch_commits.fetch_add(1, Ordering::SeqCst);
        for (id, data) in removed {
            self.publish(ChangeKind::Removed, tenant, table, &id, data);
        }
        Ok(())
    }

    fn subscribe(&self, _tenant: &str, _table: &str) -> Option<broadcast::Receiver<RemoteChange>> {
        Some(self.changes.subscribe())
    }
}
