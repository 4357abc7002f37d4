//! RecoveryEngine — one-way rebuild of the local store from the remote.
//!
//! Recovery only adds: orders already present locally are skipped, and so
//! are their items. Each order is inserted together with its items inside
//! one local transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_REMOTE_TIMEOUT_SECS;
use crate::error::{RecoveryError, RemoteError, Result};
use crate::naming;
use crate::repair::checks;
use crate::storage::tombstones;
use crate::storage::traits::{bounded, LocalStore, RemoteDocument, RemoteStore};
use crate::sync::engine::InFlight;
use crate::sync::merge;
use crate::types::{Filter, OrderStatus, Record, ORDERS, ORDER_ITEMS, SCHEMA_SENTINEL_ID};

/// Outcome of [`RecoveryEngine::recover_all`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryResult {
    pub recovered_orders: usize,
    pub recovered_items: usize,
    /// Orders already present locally, queued for deletion, or invalid.
    pub skipped: usize,
    pub failed: usize,
    /// Local order count before and after.
    pub before: usize,
    pub after: usize,
    /// The remote store had nothing to recover from.
    pub unavailable: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Progress of the current or last recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryProgress {
    pub processed: usize,
    pub total: usize,
}

impl RecoveryProgress {
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.processed.min(self.total) * 100) / self.total) as u8
    }
}

pub struct RecoveryEngine<L: LocalStore> {
    local: Arc<L>,
    remote: Arc<dyn RemoteStore>,
    remote_timeout: Duration,
    running: AtomicBool,
    cancel: AtomicBool,
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl<L: LocalStore> RecoveryEngine<L> {
    pub fn new(local: Arc<L>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            remote_timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            processed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    /// Bound each collection read. An elapsed bound ends the run like any
    /// other remote failure.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn progress(&self) -> RecoveryProgress {
        RecoveryProgress {
            processed: self.processed.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the running recovery before its next order.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// True when the local store has no orders, the usual signal that a
    /// recovery is warranted.
    pub fn local_is_empty(&self) -> Result<bool> {
        Ok(self.local.count(ORDERS, &Filter::All)? == 0)
    }

    /// Pull every remote order not present locally.
    pub async fn recover_all(&self, tenant: &str) -> Result<RecoveryResult, RecoveryError> {
        let _guard = InFlight::acquire(&self.running).ok_or(RecoveryError::AlreadyRunning)?;
        self.cancel.store(false, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);

        let mut result = RecoveryResult::default();
        match self.local.count(ORDERS, &Filter::All) {
            Ok(n) => result.before = n,
            Err(e) => {
                warn!(tenant, error = %e, "recovery could not read local orders");
                result.error = Some(e.to_string());
                return Ok(result);
            }
        }
        result.after = result.before;

        let (orders, items) = match self.fetch(tenant).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(tenant, error = %e, "recovery could not read remote orders");
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };
        if orders.is_empty() {
            info!(tenant, "remote store has no orders; nothing to recover");
            result.unavailable = true;
            return Ok(result);
        }
        self.total.store(orders.len(), Ordering::SeqCst);

        let items_by_order = group_items(&items);
        let queued = tombstones::pending_set(self.local.as_ref(), ORDERS).unwrap_or_default();
        let queued_items = tombstones::pending_set(self.local.as_ref(), ORDER_ITEMS).unwrap_or_default();

        for doc in &orders {
            if self.cancel.load(Ordering::SeqCst) {
                info!(tenant, "recovery cancelled");
                result.cancelled = true;
                break;
            }
            let order = merge::to_local_record(doc);
            let mut order_items = embedded_items(doc, order.id());
            if order_items.is_empty() {
                order_items = items_by_order.get(order.id()).cloned().unwrap_or_default();
            }
            order_items.retain(|item| !queued_items.contains(item.id()));

            if queued.contains(order.id()) || !is_recoverable(&order, &order_items) {
                debug!(id = order.id(), "skipping remote order");
                result.skipped += 1;
            } else {
                match self.insert_order(&order, &order_items) {
                    Ok(Some(n)) => {
                        result.recovered_orders += 1;
                        result.recovered_items += n;
                    }
                    Ok(None) => result.skipped += 1,
                    Err(e) => {
                        warn!(id = order.id(), error = %e, "failed to recover order");
                        result.failed += 1;
                    }
                }
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
        }

        result.after = self.local.count(ORDERS, &Filter::All).unwrap_or(result.before);
        info!(
            tenant,
            recovered_orders = result.recovered_orders,
            recovered_items = result.recovered_items,
            skipped = result.skipped,
            failed = result.failed,
            before = result.before,
            after = result.after,
            "recovery finished"
        );
        Ok(result)
    }

    async fn fetch(
        &self,
        tenant: &str,
    ) -> std::result::Result<(Vec<RemoteDocument>, Vec<RemoteDocument>), RemoteError> {
        let orders = self.remote.get_collection(tenant, ORDERS);
        let orders: Vec<RemoteDocument> = bounded(self.remote_timeout, "collection read", orders)
            .await?
            .into_iter()
            .filter(|doc| !doc.id.is_empty() && doc.id != SCHEMA_SENTINEL_ID)
            .collect();
        let items = self.remote.get_collection(tenant, ORDER_ITEMS);
        let items: Vec<RemoteDocument> = bounded(self.remote_timeout, "collection read", items)
            .await?
            .into_iter()
            .filter(|doc| !doc.id.is_empty() && doc.id != SCHEMA_SENTINEL_ID)
            .collect();
        Ok((orders, items))
    }

    /// Insert one order and its missing items. `None` when the order already
    /// exists locally.
    fn insert_order(&self, order: &Record, items: &[Record]) -> Result<Option<usize>> {
        self.local.transaction(|s| {
            if s.count(ORDERS, &Filter::id(order.id()))? > 0 {
                return Ok(None);
            }
            let mut order = order.clone();
            order.remove("items");
            let status = OrderStatus::normalize(order.get("status"));
            order.set("status", status.as_str());
            s.insert_or_replace(ORDERS, &order)?;

            let mut inserted = 0;
            for item in items {
                if s.count(ORDER_ITEMS, &Filter::id(item.id()))? > 0 {
                    continue;
                }
                s.insert_or_replace(ORDER_ITEMS, item)?;
                inserted += 1;
            }
            Ok(Some(inserted))
        })
    }
}

/// A remote order is worth recovering when it has items or a non-zero total.
fn is_recoverable(order: &Record, items: &[Record]) -> bool {
    !order.id().is_empty()
        && (!items.is_empty() || !checks::is_zero(order.get_f64("total_amount").unwrap_or(0.0)))
}

fn group_items(items: &[RemoteDocument]) -> HashMap<String, Vec<Record>> {
    let mut map: HashMap<String, Vec<Record>> = HashMap::new();
    for doc in items {
        let item = merge::to_local_record(doc);
        if let Some(order_id) = item.get_str("order_id").map(str::to_string) {
            map.entry(order_id).or_default().push(item);
        }
    }
    map
}

/// Items stored inline on the order document under `items`.
fn embedded_items(doc: &RemoteDocument, order_id: &str) -> Vec<Record> {
    let Some(Value::Array(entries)) = doc.data.get("items") else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| entry.as_object())
        .map(|fields| {
            let mut item = Record::from_map(naming::to_local(fields));
            if item.get_str("order_id").is_none() {
                item.set("order_id", order_id);
            }
            item
        })
        .filter(|item| !item.id().is_empty())
        .collect()
}
