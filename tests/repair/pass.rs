//! Individual repair operations against a SQLite store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use pos_sync::clock;
use pos_sync::config::{EngineConfig, OrphanPolicy};
use pos_sync::repair::{RepairOp, RepairPass};
use pos_sync::storage::tombstones;
use pos_sync::storage::traits::LocalStore;
use pos_sync::types::{ColumnInfo, Filter, Record, MENU_ITEMS, ORDERS, ORDER_ITEMS};
use pos_sync::SqliteStore;
use serde_json::{json, Value};

use crate::common::{item, menu_item, order, store, ts};

fn get(store: &impl LocalStore, table: &str, id: &str) -> Option<Record> {
    store.query(table, &Filter::id(id)).unwrap().into_iter().next()
}

fn later(after: &Record, before: &Record) -> bool {
    let a = after.get("updated_at").and_then(clock::parse_timestamp);
    let b = before.get("updated_at").and_then(clock::parse_timestamp);
    a > b
}

#[test]
fn sanitize_replaces_null_and_epoch_timestamps() {
    let store = store();
    let config = EngineConfig::default();
    let mut bad = order("o1", "A1", 5.0, "1970-01-01T00:00:00Z");
    bad.set("created_at", Value::Null);
    store.insert_or_replace(ORDERS, &bad).unwrap();
    store
        .insert_or_replace(ORDERS, &order("o2", "A2", 5.0, &ts(1)))
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).sanitize_timestamps();
    assert_eq!(report.fixed, 1);

    let fixed = get(store.as_ref(), ORDERS, "o1").unwrap();
    assert!(!clock::needs_sanitizing(fixed.get("created_at")));
    assert!(!clock::needs_sanitizing(fixed.get("updated_at")));
    assert_eq!(get(store.as_ref(), ORDERS, "o2").unwrap().get_str("updated_at"), Some(ts(1).as_str()));
}

#[test]
fn backfill_synthesizes_unique_placeholders() {
    let store = store();
    let config = EngineConfig::default();
    let created = ts(5);
    let millis = clock::parse_timestamp(&json!(created)).unwrap().timestamp_millis();

    let mut existing = order("o1", &format!("ORD-{millis}"), 5.0, &ts(1));
    existing.set("created_at", created.as_str());
    store.insert_or_replace(ORDERS, &existing).unwrap();

    let mut missing = order("o2", "", 5.0, &ts(1));
    missing.set("user_id", Value::Null);
    missing.set("created_at", created.as_str());
    store.insert_or_replace(ORDERS, &missing).unwrap();

    let report = RepairPass::new(store.as_ref(), &config).backfill_required();
    assert_eq!(report.fixed, 1);

    let fixed = get(store.as_ref(), ORDERS, "o2").unwrap();
    let expected_number = format!("ORD-{}", millis + 1);
    assert_eq!(fixed.get_str("order_number"), Some(expected_number.as_str()));
    assert_eq!(fixed.get_str("user_id"), Some("admin"));
    assert!(later(&fixed, &missing));
}

#[test]
fn statuses_are_normalized_and_clock_bumped() {
    let store = store();
    let config = EngineConfig::default();
    let shouting = order("o1", "A1", 5.0, &ts(1)).with("status", "READY");
    let unknown = order("o2", "A2", 5.0, &ts(1)).with("status", "shipped");
    let fine = order("o3", "A3", 5.0, &ts(1)).with("status", "completed");
    for o in [&shouting, &unknown, &fine] {
        store.insert_or_replace(ORDERS, o).unwrap();
    }

    let report = RepairPass::new(store.as_ref(), &config).normalize_statuses();
    assert_eq!(report.fixed, 2);

    let o1 = get(store.as_ref(), ORDERS, "o1").unwrap();
    assert_eq!(o1.get_str("status"), Some("ready"));
    assert!(later(&o1, &shouting));
    assert_eq!(get(store.as_ref(), ORDERS, "o2").unwrap().get_str("status"), Some("pending"));
    assert_eq!(get(store.as_ref(), ORDERS, "o3").unwrap().get_str("updated_at"), Some(ts(1).as_str()));
}

#[test]
fn duplicate_menu_items_collapse_and_repoint() {
    let store = store();
    let config = EngineConfig::default();
    store
        .insert_or_replace(MENU_ITEMS, &menu_item("m1", "Samosa", 4.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(MENU_ITEMS, &menu_item("m2", "Samosa", 4.5, &ts(2)))
        .unwrap();
    store
        .insert_or_replace(MENU_ITEMS, &menu_item("m3", "Chai", 2.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDERS, &order("o1", "A1", 4.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "o1", "m1", 1, 4.0))
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).collapse_duplicate_menu_items();
    assert_eq!(report.fixed, 1);

    let names: Vec<String> = store
        .query(MENU_ITEMS, &Filter::All)
        .unwrap()
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    assert_eq!(names, vec!["m2", "m3"]);
    assert_eq!(
        get(store.as_ref(), ORDER_ITEMS, "i1").unwrap().get_str("menu_item_id"),
        Some("m2")
    );
    assert!(tombstones::pending_set(store.as_ref(), MENU_ITEMS).unwrap().contains("m1"));
}

#[test]
fn duplicate_items_merge_quantities_into_latest() {
    let store = store();
    let config = EngineConfig::default();
    store
        .insert_or_replace(ORDERS, &order("o1", "A1", 15.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "o1", "m1", 1, 5.0))
        .unwrap();
    store
        .insert_or_replace(
            ORDER_ITEMS,
            &item("i2", "o1", "m1", 2, 5.0).with("updated_at", ts(9)),
        )
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).merge_duplicate_items();
    assert_eq!(report.fixed, 1);

    let items = store.query(ORDER_ITEMS, &Filter::All).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id(), "i2");
    assert_eq!(items[0].get_i64("quantity"), Some(3));
    assert_eq!(items[0].get_f64("total_price"), Some(15.0));
}

#[test]
fn totals_are_recomputed_from_items() {
    let store = store();
    let config = EngineConfig::default();
    store
        .insert_or_replace(
            ORDERS,
            &order("o1", "A1", 3.0, &ts(1))
                .with("tax_amount", 1.3)
                .with("tip_amount", 2.0)
                .with("discount_amount", 0.5),
        )
        .unwrap();
    store
        .insert_or_replace(ORDERS, &order("o2", "A2", 10.004, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "o1", "m1", 2, 5.0))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i2", "o2", "m1", 2, 5.0))
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).recompute_totals();
    assert_eq!(report.fixed, 1);

    let o1 = get(store.as_ref(), ORDERS, "o1").unwrap();
    assert_eq!(o1.get_f64("total_amount"), Some(10.0));
    assert_eq!(o1.get_f64("subtotal"), Some(10.0));
    assert_eq!(o1.get_f64("tax_amount"), Some(1.3));
    // Within epsilon: untouched.
    assert_eq!(get(store.as_ref(), ORDERS, "o2").unwrap().get_f64("total_amount"), Some(10.004));
}

#[test]
fn adjustments_never_trigger_a_total_rewrite() {
    let store = store();
    let config = EngineConfig::default();
    store
        .insert_or_replace(
            ORDERS,
            &order("o1", "A1", 10.0, &ts(1)).with("tax_amount", 1.3),
        )
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "o1", "m1", 2, 5.0))
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).run_all();
    assert_eq!(report.fixed_by(RepairOp::RecomputeTotals), 0);
    let o1 = get(store.as_ref(), ORDERS, "o1").unwrap();
    assert_eq!(o1.get_f64("total_amount"), Some(10.0));
    assert_eq!(o1.get_str("updated_at"), Some(ts(1).as_str()));
}

#[test]
fn ghost_orders_are_purged_and_queued() {
    let store = store();
    let config = EngineConfig::default();
    store
        .insert_or_replace(ORDERS, &order("ghost", "G1", 0.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDERS, &order("draft", "D1", 0.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "draft", "m1", 1, 0.0))
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).purge_ghosts();
    assert_eq!(report.fixed, 1);
    assert!(get(store.as_ref(), ORDERS, "ghost").is_none());
    assert!(get(store.as_ref(), ORDERS, "draft").is_some());
    assert_eq!(
        tombstones::pending(store.as_ref(), ORDERS).unwrap(),
        vec!["ghost".to_string()]
    );
}

#[test]
fn reconstruct_policy_keeps_orphans_with_a_parent_id() {
    let store = store();
    let config = EngineConfig {
        orphan_policy: OrphanPolicy::Reconstruct,
        ..EngineConfig::default()
    };
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "X", "m1", 1, 5.0))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i2", "X", "m2", 2, 7.0))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &Record::new("i3").with("quantity", 1))
        .unwrap();

    let report = RepairPass::new(store.as_ref(), &config).run_all();
    assert_eq!(report.fixed_by(RepairOp::ReconstructOrphans), 1);
    assert_eq!(report.fixed_by(RepairOp::RemoveOrphans), 1);
    assert_eq!(report.fixed_by(RepairOp::RecomputeTotals), 0);

    let rebuilt = get(store.as_ref(), ORDERS, "X").unwrap();
    assert_eq!(rebuilt.get_str("order_number"), Some("REC-X"));
    assert_eq!(rebuilt.get_f64("subtotal"), Some(19.0));
    assert_eq!(rebuilt.get_f64("total_amount"), Some(19.0));
    assert_eq!(rebuilt.get_f64("tax_amount"), Some(2.47));
    assert_eq!(store.count(ORDER_ITEMS, &Filter::All).unwrap(), 2);
    assert!(get(store.as_ref(), ORDER_ITEMS, "i3").is_none());
}

/// Store that raises its cancel flag once `limit` transactions have
/// committed.
struct CancellingStore {
    inner: Arc<SqliteStore>,
    cancel: AtomicBool,
    committed: AtomicUsize,
    limit: usize,
}

impl LocalStore for CancellingStore {
    fn query(&self, table: &str, filter: &Filter) -> pos_sync::Result<Vec<Record>> {
        self.inner.query(table, filter)
    }

    fn insert_or_replace(&self, table: &str, record: &Record) -> pos_sync::Result<()> {
        self.inner.insert_or_replace(table, record)
    }

    fn delete_where(&self, table: &str, filter: &Filter) -> pos_sync::Result<usize> {
        self.inner.delete_where(table, filter)
    }

    fn transaction<F, T>(&self, f: F) -> pos_sync::Result<T>
    where
        F: FnOnce(&Self) -> pos_sync::Result<T>,
    {
        let result = self.inner.transaction(|_| f(self))?;
        if self.committed.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            self.cancel.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    fn raw_columns(&self, table: &str) -> pos_sync::Result<Vec<ColumnInfo>> {
        self.inner.raw_columns(table)
    }

    fn table_names(&self) -> pos_sync::Result<Vec<String>> {
        self.inner.table_names()
    }

    fn get_meta(&self, key: &str) -> pos_sync::Result<Option<String>> {
        self.inner.get_meta(key)
    }

    fn set_meta(&self, key: &str, value: &str) -> pos_sync::Result<()> {
        self.inner.set_meta(key, value)
    }
}

#[test]
fn cancelled_pass_keeps_committed_fixes_and_stops() {
    const GHOSTS: usize = 50;
    let inner = store();
    for n in 0..GHOSTS {
        let id = format!("g{n:02}");
        inner
            .insert_or_replace(ORDERS, &order(&id, &id, 0.0, &ts(1)))
            .unwrap();
    }
    let store = CancellingStore {
        inner: Arc::clone(&inner),
        cancel: AtomicBool::new(false),
        committed: AtomicUsize::new(0),
        limit: 10,
    };
    let config = EngineConfig::default();

    let report = RepairPass::new(&store, &config)
        .with_cancel(&store.cancel)
        .run_all();

    assert!(report.cancelled);
    let purged = report.fixed_by(RepairOp::PurgeGhosts);
    assert!(purged > 0 && purged < GHOSTS);
    assert_eq!(inner.count(ORDERS, &Filter::All).unwrap(), GHOSTS - purged);
    assert_eq!(tombstones::pending(inner.as_ref(), ORDERS).unwrap().len(), purged);
}

#[test]
fn pass_cancelled_up_front_changes_nothing() {
    let store = store();
    store
        .insert_or_replace(ORDERS, &order("g1", "G1", 0.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "missing", "m1", 1, 5.0))
        .unwrap();
    let config = EngineConfig::default();
    let cancel = AtomicBool::new(true);

    let report = RepairPass::new(store.as_ref(), &config).with_cancel(&cancel).run_all();

    assert!(report.cancelled);
    assert!(report.operations.is_empty());
    assert_eq!(RepairPass::new(store.as_ref(), &config).with_cancel(&cancel).purge_ghosts().fixed, 0);
    assert!(get(store.as_ref(), ORDERS, "g1").is_some());
    assert!(get(store.as_ref(), ORDER_ITEMS, "i1").is_some());
}
