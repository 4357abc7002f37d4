//! Reconstruction Engine: rebuild lost orders from their surviving items.
//!
//! This is the alternative to orphan deletion. [`ReconstructionEngine`]
//! only proposes orders; nothing is written until [`ReconstructionEngine::persist`]
//! is called, so an operator can inspect the result first.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock;
use crate::error::Result;
use crate::repair::checks::{self, StoreView};
use crate::storage::traits::LocalStore;
use crate::types::{Filter, OrderStatus, Record, ORDERS};

/// Read-only summary used to decide whether reconstruction is worthwhile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionAnalysis {
    pub total_items: usize,
    pub orphaned_items: usize,
    /// Distinct missing order ids referenced by orphans.
    pub orphan_order_ids: usize,
    pub existing_orders: usize,
}

pub fn analyze<L: LocalStore>(store: &L) -> Result<ReconstructionAnalysis> {
    let view = StoreView::load(store)?;
    Ok(ReconstructionAnalysis {
        total_items: view.items.len(),
        orphaned_items: checks::orphan_items(&view).len(),
        orphan_order_ids: checks::orphan_groups(&view).len(),
        existing_orders: view.orders.len(),
    })
}

/// Build one pending order per orphan group. Pure.
pub fn synthesize(
    groups: &BTreeMap<String, Vec<Record>>,
    tax_rate: f64,
    user_id: &str,
) -> Vec<Record> {
    groups
        .iter()
        .filter(|(_, items)| !items.is_empty())
        .map(|(order_id, items)| {
            let created = items
                .iter()
                .filter_map(|i| i.get("created_at").and_then(clock::parse_timestamp))
                .min()
                .unwrap_or_else(clock::now);
            let updated = items
                .iter()
                .filter_map(|i| i.get("updated_at").and_then(clock::parse_timestamp))
                .max()
                .unwrap_or(created)
                .max(created);
            let subtotal = checks::items_subtotal(items);
            let tax = checks::round_cents(subtotal * tax_rate);
            let created = clock::format_timestamp(created);

            Record::new(order_id.as_str())
                .with("order_number", format!("REC-{order_id}"))
                .with("status", OrderStatus::Pending.as_str())
                .with("type", "dine_in")
                .with("user_id", user_id)
                .with("subtotal", subtotal)
                .with("tax_amount", tax)
                .with("total_amount", subtotal)
                .with("payment_status", "pending")
                .with(
                    "notes",
                    format!("Reconstructed from {} orphaned items", items.len()),
                )
                .with("order_time", created.as_str())
                .with("created_at", created.as_str())
                .with("updated_at", clock::format_timestamp(updated))
        })
        .collect()
}

/// Insert `order` unless an order with its id already exists. Returns
/// whether it was inserted.
pub fn persist_one<L: LocalStore>(store: &L, order: &Record) -> Result<bool> {
    store.transaction(|s| {
        if s.count(ORDERS, &Filter::id(order.id()))? > 0 {
            return Ok(false);
        }
        s.insert_or_replace(ORDERS, order)?;
        Ok(true)
    })
}

pub struct ReconstructionEngine<L: LocalStore> {
    store: Arc<L>,
    tax_rate: f64,
    user_id: String,
}

impl<L: LocalStore> ReconstructionEngine<L> {
    pub fn new(store: Arc<L>, tax_rate: f64, user_id: impl Into<String>) -> Self {
        Self {
            store,
            tax_rate,
            user_id: user_id.into(),
        }
    }

    pub fn analyze(&self) -> Result<ReconstructionAnalysis> {
        analyze(self.store.as_ref())
    }

    /// Orders that would restore every orphan group. No side effects.
    pub fn reconstruct_orphans(&self) -> Result<Vec<Record>> {
        let view = StoreView::load(self.store.as_ref())?;
        Ok(synthesize(
            &checks::orphan_groups(&view),
            self.tax_rate,
            &self.user_id,
        ))
    }

    /// Insert the given orders, skipping ids that already exist. Failures
    /// are logged and skipped.
    pub fn persist(&self, orders: &[Record]) -> usize {
        let mut inserted = 0;
        for order in orders {
            match persist_one(self.store.as_ref(), order) {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => warn!(id = order.id(), error = %e, "failed to persist reconstructed order"),
            }
        }
        info!(inserted, proposed = orders.len(), "persisted reconstructed orders");
        inserted
    }
}
