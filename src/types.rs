use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Table names
// ============================================================================

pub const ORDERS: &str = "orders";
pub const ORDER_ITEMS: &str = "order_items";
pub const MENU_ITEMS: &str = "menu_items";
pub const CATEGORIES: &str = "categories";
pub const USERS: &str = "users";
pub const PRINTER_CONFIGS: &str = "printer_configs";

/// Tables reconciled with the remote store by default.
pub const DEFAULT_SYNCED_TABLES: [&str; 6] = [
    ORDERS,
    ORDER_ITEMS,
    MENU_ITEMS,
    CATEGORIES,
    USERS,
    PRINTER_CONFIGS,
];

/// Sentinel document id holding the schema descriptor of a remote collection.
pub const SCHEMA_SENTINEL_ID: &str = "_schema";

// ============================================================================
// Record
// ============================================================================

/// A row (locally) or document (remotely), keyed by its `id` field.
///
/// Field names are in the local snake_case convention; translation to the
/// remote convention happens at the adapter boundary (see [`crate::naming`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::String(id.into()));
        Self { fields }
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build from a JSON object. Non-object values yield an empty record.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    /// The record id, or `""` when missing.
    pub fn id(&self) -> &str {
        self.fields.get("id").and_then(Value::as_str).unwrap_or("")
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Non-empty string value of `field`.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Numeric value of `field`, accepting numeric strings.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        match self.fields.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        match self.fields.get(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Builder-style `set`.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Row predicate understood by every [`LocalStore`](crate::storage::traits::LocalStore).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn id(id: impl Into<String>) -> Self {
        Filter::Eq("id".to_string(), Value::String(id.into()))
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In(
            "id".to_string(),
            ids.into_iter().map(|s| Value::String(s.into())).collect(),
        )
    }
}

// ============================================================================
// ColumnInfo
// ============================================================================

/// One column of a local table, as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared SQL type (`TEXT`, `INTEGER`, `REAL`, ...).
    pub data_type: String,
    pub primary_key: bool,
}

// ============================================================================
// OrderStatus
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Normalized form of a stored status value: exact members pass through,
    /// case variants are lower-cased, anything else is `pending`.
    pub fn normalize(raw: Option<&Value>) -> OrderStatus {
        raw.and_then(Value::as_str)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown order status: {s}"))
    }
}

// ============================================================================
// Tests
// ============================================================================
