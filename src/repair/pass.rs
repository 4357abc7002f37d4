//! Integrity Repair Pass.
//!
//! Each operation is local-only and idempotent: on a clean store it changes
//! nothing. Every individual fix (one record, one duplicate group) runs in its
//! own local transaction, so an interrupted pass leaves at most one unit of
//! work unresolved. A cancelled pass stops before its next fix. Deletions
//! are queued for the remote side in the same transaction (see
//! [`crate::storage::tombstones`]).

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::{EngineConfig, OrphanPolicy};
use crate::error::Result;
use crate::recovery::reconstruct;
use crate::storage::tombstones;
use crate::storage::traits::LocalStore;
use crate::types::{Filter, Record, MENU_ITEMS, ORDERS, ORDER_ITEMS};

use super::checks::{self, StoreView};

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOp {
    SanitizeTimestamps,
    BackfillRequired,
    NormalizeStatus,
    CollapseDuplicateOrders,
    CollapseDuplicateMenuItems,
    MergeDuplicateItems,
    RemoveOrphans,
    ReconstructOrphans,
    RecomputeTotals,
    PurgeGhosts,
}

impl RepairOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairOp::SanitizeTimestamps => "sanitize_timestamps",
            RepairOp::BackfillRequired => "backfill_required",
            RepairOp::NormalizeStatus => "normalize_status",
            RepairOp::CollapseDuplicateOrders => "collapse_duplicate_orders",
            RepairOp::CollapseDuplicateMenuItems => "collapse_duplicate_menu_items",
            RepairOp::MergeDuplicateItems => "merge_duplicate_items",
            RepairOp::RemoveOrphans => "remove_orphans",
            RepairOp::ReconstructOrphans => "reconstruct_orphans",
            RepairOp::RecomputeTotals => "recompute_totals",
            RepairOp::PurgeGhosts => "purge_ghosts",
        }
    }
}

impl fmt::Display for RepairOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fix that could not be applied. The rest of the batch still ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairFailure {
    pub op: RepairOp,
    pub table: String,
    pub id: Option<String>,
    pub error: String,
}

/// Outcome of one repair operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpReport {
    pub op: RepairOp,
    /// Records changed or removed.
    pub fixed: usize,
    pub failures: Vec<RepairFailure>,
}

impl OpReport {
    fn new(op: RepairOp) -> Self {
        Self {
            op,
            fixed: 0,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn fail(&mut self, table: &str, id: Option<&str>, error: impl fmt::Display) {
        let error = error.to_string();
        warn!(op = %self.op, table, id, %error, "repair fix failed");
        self.failures.push(RepairFailure {
            op: self.op,
            table: table.to_string(),
            id: id.map(str::to_string),
            error,
        });
    }
}

/// Outcome of a full pass, one entry per operation in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub operations: Vec<OpReport>,
    /// The pass stopped early; later operations did not run.
    pub cancelled: bool,
}

impl RepairReport {
    pub fn fixed(&self) -> usize {
        self.operations.iter().map(|o| o.fixed).sum()
    }

    pub fn failed(&self) -> usize {
        self.operations.iter().map(OpReport::failed).sum()
    }

    /// Fixes attempted, successful or not.
    pub fn attempted(&self) -> usize {
        self.fixed() + self.failed()
    }

    pub fn get(&self, op: RepairOp) -> Option<&OpReport> {
        self.operations.iter().find(|o| o.op == op)
    }

    /// Records fixed by `op`, 0 when it did not run.
    pub fn fixed_by(&self, op: RepairOp) -> usize {
        self.get(op).map_or(0, |o| o.fixed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RepairFailure> {
        self.operations.iter().flat_map(|o| o.failures.iter())
    }
}

// ============================================================================
// RepairPass
// ============================================================================

pub struct RepairPass<'a, L: LocalStore> {
    store: &'a L,
    config: &'a EngineConfig,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, L: LocalStore> RepairPass<'a, L> {
    pub fn new(store: &'a L, config: &'a EngineConfig) -> Self {
        Self {
            store,
            config,
            cancel: None,
        }
    }

    /// Stop before the next fix once `flag` is set. Fixes already committed
    /// stay.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Run every operation in dependency order.
    ///
    /// Menu duplicates collapse before item duplicates because repointing can
    /// make two items of one order collide. Totals are recomputed after item
    /// merges, and ghosts are purged last so that orders emptied by the
    /// earlier steps are caught in the same pass.
    pub fn run_all(&self) -> RepairReport {
        let mut steps: Vec<fn(&Self) -> OpReport> = vec![
            Self::sanitize_timestamps,
            Self::backfill_required,
            Self::normalize_statuses,
            Self::collapse_duplicate_orders,
            Self::collapse_duplicate_menu_items,
            Self::merge_duplicate_items,
        ];
        if self.config.orphan_policy == OrphanPolicy::Reconstruct {
            steps.push(Self::reconstruct_orphans);
        }
        steps.push(Self::remove_orphans);
        steps.push(Self::recompute_totals);
        steps.push(Self::purge_ghosts);

        let mut report = RepairReport::default();
        for step in steps {
            if self.cancelled() {
                break;
            }
            report.operations.push(step(self));
        }
        report.cancelled = self.cancelled();
        info!(
            fixed = report.fixed(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "integrity repair pass finished"
        );
        report
    }

    fn load(&self, report: &mut OpReport) -> Option<StoreView> {
        match StoreView::load(self.store) {
            Ok(view) => Some(view),
            Err(e) => {
                report.fail(ORDERS, None, e);
                None
            }
        }
    }

    fn tables_with_timestamps(&self) -> Vec<String> {
        let mut tables: Vec<String> = [ORDERS, ORDER_ITEMS, MENU_ITEMS]
            .iter()
            .map(|t| t.to_string())
            .collect();
        for table in &self.config.synced_tables {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
        tables
    }

    /// Replace null, epoch-zero or unparsable `created_at`/`updated_at`.
    pub fn sanitize_timestamps(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::SanitizeTimestamps);
        for table in self.tables_with_timestamps() {
            let records = match self.store.query(&table, &Filter::All) {
                Ok(records) => records,
                Err(e) => {
                    report.fail(&table, None, e);
                    continue;
                }
            };
            for mut record in checks::bad_timestamps(&records).into_iter().cloned() {
                if self.cancelled() {
                    return report;
                }
                let now = clock::now_string();
                let created_bad = clock::needs_sanitizing(record.get("created_at"));
                let updated_bad = clock::needs_sanitizing(record.get("updated_at"));
                if created_bad {
                    record.set("created_at", now.as_str());
                }
                if updated_bad {
                    record.set("updated_at", now.as_str());
                }
                match self.store.transaction(|s| s.insert_or_replace(&table, &record)) {
                    Ok(()) => {
                        debug!(table = %table, id = record.id(), "sanitized timestamps");
                        report.fixed += 1;
                    }
                    Err(e) => report.fail(&table, Some(record.id()), e),
                }
            }
        }
        report
    }

    /// Synthesize placeholders for orders missing required fields.
    pub fn backfill_required(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::BackfillRequired);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        let mut taken: HashSet<String> = view
            .orders
            .iter()
            .filter_map(|o| o.get_str("order_number").map(str::to_string))
            .collect();

        for order in checks::missing_required(&view) {
            if self.cancelled() {
                break;
            }
            let mut fixed = order.clone();
            if fixed.get_str("order_number").is_none() {
                let base = fixed
                    .get("created_at")
                    .and_then(clock::parse_timestamp)
                    .unwrap_or_else(clock::now)
                    .timestamp_millis();
                fixed.set("order_number", unique_order_number(base, &mut taken));
            }
            if fixed.get_str("user_id").is_none() {
                fixed.set("user_id", self.config.fallback_user_id.as_str());
            }
            if fixed.get_str("created_at").is_none() {
                fixed.set("created_at", clock::now_string());
            }
            let next = clock::bump(fixed.get("updated_at"));
            fixed.set("updated_at", next);

            match self.store.transaction(|s| s.insert_or_replace(ORDERS, &fixed)) {
                Ok(()) => report.fixed += 1,
                Err(e) => report.fail(ORDERS, Some(fixed.id()), e),
            }
        }
        report
    }

    /// Rewrite invalid order statuses to their normalized value.
    pub fn normalize_statuses(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::NormalizeStatus);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        for (order, status) in checks::invalid_statuses(&view) {
            if self.cancelled() {
                break;
            }
            let mut fixed = order.clone();
            fixed.set("status", status.as_str());
            let next = clock::bump(fixed.get("updated_at"));
            fixed.set("updated_at", next);
            match self.store.transaction(|s| s.insert_or_replace(ORDERS, &fixed)) {
                Ok(()) => {
                    debug!(id = fixed.id(), status = %status, "normalized order status");
                    report.fixed += 1;
                }
                Err(e) => report.fail(ORDERS, Some(fixed.id()), e),
            }
        }
        report
    }

    /// Keep the latest order per `order_number`; delete the rest with their
    /// items.
    pub fn collapse_duplicate_orders(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::CollapseDuplicateOrders);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        let by_order = view.items_by_order();
        for group in checks::duplicate_orders(&view) {
            if self.cancelled() {
                break;
            }
            let item_ids: Vec<String> = group
                .drop
                .iter()
                .filter_map(|id| by_order.get(id.as_str()))
                .flatten()
                .map(|item| item.id().to_string())
                .collect();
            let result = self.store.transaction(|s| {
                delete_queued(s, ORDER_ITEMS, &item_ids)?;
                delete_queued(s, ORDERS, &group.drop)
            });
            match result {
                Ok(n) => {
                    info!(
                        order_number = %group.key,
                        kept = %group.keep,
                        removed = n,
                        "collapsed duplicate orders"
                    );
                    report.fixed += n;
                }
                Err(e) => report.fail(ORDERS, Some(&group.keep), e),
            }
        }
        report
    }

    /// Keep the latest menu item per name, repoint order items at it and
    /// delete the rest.
    pub fn collapse_duplicate_menu_items(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::CollapseDuplicateMenuItems);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        for group in checks::duplicate_menu_items(&view) {
            if self.cancelled() {
                break;
            }
            let dropped: HashSet<&str> = group.drop.iter().map(String::as_str).collect();
            let repointed: Vec<Record> = view
                .items
                .iter()
                .filter(|i| i.get_str("menu_item_id").is_some_and(|m| dropped.contains(m)))
                .map(|i| {
                    let mut item = i.clone();
                    item.set("menu_item_id", group.keep.as_str());
                    let next = clock::bump(item.get("updated_at"));
                    item.set("updated_at", next);
                    item
                })
                .collect();
            let result = self.store.transaction(|s| {
                for item in &repointed {
                    s.insert_or_replace(ORDER_ITEMS, item)?;
                }
                delete_queued(s, MENU_ITEMS, &group.drop)
            });
            match result {
                Ok(n) => {
                    info!(
                        name = %group.key,
                        kept = %group.keep,
                        repointed = repointed.len(),
                        "collapsed duplicate menu items"
                    );
                    report.fixed += n;
                }
                Err(e) => report.fail(MENU_ITEMS, Some(&group.keep), e),
            }
        }
        report
    }

    /// Sum quantities of items sharing `(order_id, menu_item_id)` into the
    /// latest one and delete the rest.
    pub fn merge_duplicate_items(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::MergeDuplicateItems);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        for group in checks::duplicate_items(&view) {
            if self.cancelled() {
                break;
            }
            let members: Vec<&Record> = view
                .items
                .iter()
                .filter(|i| i.id() == group.keep || group.drop.iter().any(|d| d == i.id()))
                .collect();
            let Some(keep) = members.iter().find(|i| i.id() == group.keep) else {
                continue;
            };
            let quantity: i64 = members.iter().map(|i| i.get_i64("quantity").unwrap_or(0)).sum();
            let mut merged = (*keep).clone();
            merged.set("quantity", quantity);
            if let Some(price) = merged.get_f64("unit_price") {
                merged.set("total_price", checks::round_cents(price * quantity as f64));
            }
            let next = clock::bump(merged.get("updated_at"));
            merged.set("updated_at", next);

            let result = self.store.transaction(|s| {
                s.insert_or_replace(ORDER_ITEMS, &merged)?;
                delete_queued(s, ORDER_ITEMS, &group.drop)
            });
            match result {
                Ok(n) => {
                    debug!(kept = %group.keep, removed = n, quantity, "merged duplicate items");
                    report.fixed += n;
                }
                Err(e) => report.fail(ORDER_ITEMS, Some(&group.keep), e),
            }
        }
        report
    }

    /// Delete order items whose order does not exist.
    pub fn remove_orphans(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::RemoveOrphans);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        for orphan in checks::orphan_items(&view) {
            if self.cancelled() {
                break;
            }
            let ids = vec![orphan.id().to_string()];
            match self.store.transaction(|s| delete_queued(s, ORDER_ITEMS, &ids)) {
                Ok(n) => {
                    debug!(
                        id = orphan.id(),
                        order_id = orphan.get_str("order_id"),
                        "removed orphaned item"
                    );
                    report.fixed += n;
                }
                Err(e) => report.fail(ORDER_ITEMS, Some(orphan.id()), e),
            }
        }
        report
    }

    /// Synthesize parent orders for orphaned items. Items without any
    /// `order_id` are left for [`Self::remove_orphans`].
    pub fn reconstruct_orphans(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::ReconstructOrphans);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        let orders = reconstruct::synthesize(
            &checks::orphan_groups(&view),
            self.config.tax_rate,
            &self.config.fallback_user_id,
        );
        for order in orders {
            if self.cancelled() {
                break;
            }
            match reconstruct::persist_one(self.store, &order) {
                Ok(true) => {
                    info!(id = order.id(), "reconstructed missing order");
                    report.fixed += 1;
                }
                Ok(false) => {}
                Err(e) => report.fail(ORDERS, Some(order.id()), e),
            }
        }
        report
    }

    /// Correct `total_amount` of orders whose items disagree with it.
    pub fn recompute_totals(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::RecomputeTotals);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        let by_order = view.items_by_order();
        for (order, expected) in checks::total_mismatches(&view, self.config.total_epsilon) {
            if self.cancelled() {
                break;
            }
            let mut fixed = order.clone();
            let previous = fixed.get_f64("total_amount");
            if let Some(items) = by_order.get(order.id()) {
                fixed.set("subtotal", checks::items_subtotal(items.iter().copied()));
            }
            fixed.set("total_amount", expected);
            let next = clock::bump(fixed.get("updated_at"));
            fixed.set("updated_at", next);
            match self.store.transaction(|s| s.insert_or_replace(ORDERS, &fixed)) {
                Ok(()) => {
                    debug!(id = fixed.id(), ?previous, expected, "recomputed order total");
                    report.fixed += 1;
                }
                Err(e) => report.fail(ORDERS, Some(fixed.id()), e),
            }
        }
        report
    }

    /// Delete orders with zero total and no items. The remote copies are
    /// deleted by the next connected reconciliation.
    pub fn purge_ghosts(&self) -> OpReport {
        let mut report = OpReport::new(RepairOp::PurgeGhosts);
        let Some(view) = self.load(&mut report) else {
            return report;
        };
        for ghost in checks::ghost_orders(&view) {
            if self.cancelled() {
                break;
            }
            let ids = vec![ghost.id().to_string()];
            match self.store.transaction(|s| delete_queued(s, ORDERS, &ids)) {
                Ok(n) => {
                    info!(id = ghost.id(), order_number = ghost.get_str("order_number"), "purged ghost order");
                    report.fixed += n;
                }
                Err(e) => report.fail(ORDERS, Some(ghost.id()), e),
            }
        }
        report
    }
}

/// Delete `ids` from `table` and queue them for remote deletion. Call inside
/// a transaction.
fn delete_queued<L: LocalStore>(store: &L, table: &str, ids: &[String]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let n = store.delete_where(table, &Filter::ids(ids.iter().map(String::as_str)))?;
    tombstones::enqueue(store, table, ids)?;
    Ok(n)
}

/// `ORD-<millis>`, bumped by one millisecond until unused.
fn unique_order_number(mut millis: i64, taken: &mut HashSet<String>) -> String {
    loop {
        let candidate = format!("ORD-{millis}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        millis += 1;
    }
}
