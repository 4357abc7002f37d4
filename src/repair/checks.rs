//! Read-only anomaly detection.
//!
//! Every function here is pure over a [`StoreView`]. The repair pass uses
//! them to find what to fix; the validation phase uses them to count what
//! is left; reconstruction uses the orphan grouping.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::Result;
use crate::storage::traits::LocalStore;
use crate::types::{Filter, OrderStatus, Record, MENU_ITEMS, ORDERS, ORDER_ITEMS};

/// Fields every order must carry.
pub const REQUIRED_ORDER_FIELDS: [&str; 4] = ["order_number", "user_id", "created_at", "updated_at"];

// ============================================================================
// StoreView
// ============================================================================

/// Snapshot of the tables the integrity checks look at.
#[derive(Debug, Clone, Default)]
pub struct StoreView {
    pub orders: Vec<Record>,
    pub items: Vec<Record>,
    pub menu_items: Vec<Record>,
}

impl StoreView {
    pub fn load<L: LocalStore>(store: &L) -> Result<Self> {
        Ok(Self {
            orders: store.query(ORDERS, &Filter::All)?,
            items: store.query(ORDER_ITEMS, &Filter::All)?,
            menu_items: store.query(MENU_ITEMS, &Filter::All)?,
        })
    }

    pub fn order_ids(&self) -> HashSet<&str> {
        self.orders.iter().map(Record::id).collect()
    }

    /// Items grouped by their `order_id`.
    pub fn items_by_order(&self) -> HashMap<&str, Vec<&Record>> {
        let mut map: HashMap<&str, Vec<&Record>> = HashMap::new();
        for item in &self.items {
            if let Some(order_id) = item.get_str("order_id") {
                map.entry(order_id).or_default().push(item);
            }
        }
        map
    }
}

// ============================================================================
// Recency
// ============================================================================

/// Order records by `updated_at` (unparsable = oldest), then by id.
pub fn recency(a: &Record, b: &Record) -> Ordering {
    let ta = a.get("updated_at").and_then(clock::parse_timestamp);
    let tb = b.get("updated_at").and_then(clock::parse_timestamp);
    ta.cmp(&tb).then_with(|| a.id().cmp(b.id()))
}

/// A group of records that collide on some key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: String,
    /// The most recently updated member.
    pub keep: String,
    /// Every other member.
    pub drop: Vec<String>,
}

fn duplicate_groups<'a, I>(records: I, key_of: impl Fn(&Record) -> Option<String>) -> Vec<DuplicateGroup>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut groups: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
    for r in records {
        if let Some(key) = key_of(r) {
            groups.entry(key).or_default().push(r);
        }
    }
    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|(key, mut members)| {
            members.sort_by(|a, b| recency(b, a));
            let (keep, rest) = members.split_first()?;
            Some(DuplicateGroup {
                key,
                keep: keep.id().to_string(),
                drop: rest.iter().map(|r| r.id().to_string()).collect(),
            })
        })
        .collect()
}

// ============================================================================
// Checks
// ============================================================================

/// Items whose `order_id` is empty or does not resolve to an order.
pub fn orphan_items(view: &StoreView) -> Vec<&Record> {
    let order_ids = view.order_ids();
    view.items
        .iter()
        .filter(|item| match item.get_str("order_id") {
            Some(order_id) => !order_ids.contains(order_id),
            None => true,
        })
        .collect()
}

/// Orphans with a non-empty `order_id`, grouped by that id.
pub fn orphan_groups(view: &StoreView) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for item in orphan_items(view) {
        if let Some(order_id) = item.get_str("order_id") {
            groups.entry(order_id.to_string()).or_default().push(item.clone());
        }
    }
    groups
}

/// Orders whose stored status differs from its normalized form.
pub fn invalid_statuses(view: &StoreView) -> Vec<(&Record, OrderStatus)> {
    view.orders
        .iter()
        .filter_map(|order| {
            let normalized = OrderStatus::normalize(order.get("status"));
            let current = order.get("status").and_then(|v| v.as_str());
            (current != Some(normalized.as_str())).then_some((order, normalized))
        })
        .collect()
}

/// Orders missing one of [`REQUIRED_ORDER_FIELDS`].
pub fn missing_required(view: &StoreView) -> Vec<&Record> {
    view.orders
        .iter()
        .filter(|o| REQUIRED_ORDER_FIELDS.iter().any(|f| o.get_str(f).is_none()))
        .collect()
}

/// Records with a null, epoch-zero or unparsable timestamp.
pub fn bad_timestamps(records: &[Record]) -> Vec<&Record> {
    records
        .iter()
        .filter(|r| {
            clock::needs_sanitizing(r.get("created_at"))
                || clock::needs_sanitizing(r.get("updated_at"))
        })
        .collect()
}

pub fn duplicate_orders(view: &StoreView) -> Vec<DuplicateGroup> {
    duplicate_groups(&view.orders, |o| o.get_str("order_number").map(str::to_string))
}

/// Items sharing `(order_id, menu_item_id)`.
pub fn duplicate_items(view: &StoreView) -> Vec<DuplicateGroup> {
    duplicate_groups(&view.items, |i| {
        match (i.get_str("order_id"), i.get_str("menu_item_id")) {
            (Some(order_id), Some(menu_item_id)) => Some(format!("{order_id}\u{1f}{menu_item_id}")),
            _ => None,
        }
    })
}

pub fn duplicate_menu_items(view: &StoreView) -> Vec<DuplicateGroup> {
    duplicate_groups(&view.menu_items, |m| {
        m.get_str("name").map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
    })
}

/// Orders with zero total and no items.
pub fn ghost_orders(view: &StoreView) -> Vec<&Record> {
    let by_order = view.items_by_order();
    view.orders
        .iter()
        .filter(|o| is_zero(o.get_f64("total_amount").unwrap_or(0.0)) && !by_order.contains_key(o.id()))
        .collect()
}

pub(crate) fn is_zero(amount: f64) -> bool {
    amount.abs() < 1e-9
}

/// Σ quantity × unit_price over `items`, rounded to cents.
pub fn items_subtotal<'a, I>(items: I) -> f64
where
    I: IntoIterator<Item = &'a Record>,
{
    round_cents(
        items
            .into_iter()
            .map(|i| i.get_f64("quantity").unwrap_or(0.0) * i.get_f64("unit_price").unwrap_or(0.0))
            .sum(),
    )
}

/// Orders with items whose total is off from Σ quantity × unit_price by
/// more than `epsilon`, paired with the corrected total. Tax, tip and
/// discount columns are informational and never enter the comparison.
pub fn total_mismatches(view: &StoreView, epsilon: f64) -> Vec<(&Record, f64)> {
    let by_order = view.items_by_order();
    view.orders
        .iter()
        .filter_map(|order| {
            let items = by_order.get(order.id())?;
            let expected = items_subtotal(items.iter().copied());
            let actual = order.get_f64("total_amount").unwrap_or(0.0);
            ((actual - expected).abs() > epsilon).then_some((order, expected))
        })
        .collect()
}

/// Items pointing at a menu item that no longer exists. Tolerated.
pub fn dangling_menu_refs(view: &StoreView) -> Vec<&Record> {
    let menu_ids: HashSet<&str> = view.menu_items.iter().map(Record::id).collect();
    view.items
        .iter()
        .filter(|i| i.get_str("menu_item_id").is_some_and(|m| !menu_ids.contains(m)))
        .collect()
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

// ============================================================================
// AnomalyCounts
// ============================================================================

/// Remaining anomalies, as reported by the validation phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyCounts {
    pub orphan_items: usize,
    pub invalid_statuses: usize,
    pub missing_required: usize,
    pub bad_timestamps: usize,
    pub duplicate_orders: usize,
    pub duplicate_items: usize,
    pub duplicate_menu_items: usize,
    pub ghost_orders: usize,
    pub total_mismatches: usize,
    /// Informational; dangling menu references are kept for history.
    pub dangling_menu_refs: usize,
}

impl AnomalyCounts {
    pub fn collect(view: &StoreView, epsilon: f64) -> Self {
        let mut ts_records = view.orders.clone();
        ts_records.extend(view.items.iter().cloned());
        ts_records.extend(view.menu_items.iter().cloned());
        Self {
            orphan_items: orphan_items(view).len(),
            invalid_statuses: invalid_statuses(view).len(),
            missing_required: missing_required(view).len(),
            bad_timestamps: bad_timestamps(&ts_records).len(),
            duplicate_orders: duplicate_orders(view).iter().map(|g| g.drop.len()).sum(),
            duplicate_items: duplicate_items(view).iter().map(|g| g.drop.len()).sum(),
            duplicate_menu_items: duplicate_menu_items(view).iter().map(|g| g.drop.len()).sum(),
            ghost_orders: ghost_orders(view).len(),
            total_mismatches: total_mismatches(view, epsilon).len(),
            dangling_menu_refs: dangling_menu_refs(view).len(),
        }
    }

    /// Sum of all invariant violations (dangling menu references excluded).
    pub fn violations(&self) -> usize {
        self.orphan_items
            + self.invalid_statuses
            + self.missing_required
            + self.bad_timestamps
            + self.duplicate_orders
            + self.duplicate_items
            + self.duplicate_menu_items
            + self.ghost_orders
            + self.total_mismatches
    }

    pub fn is_clean(&self) -> bool {
        self.violations() == 0
    }
}
