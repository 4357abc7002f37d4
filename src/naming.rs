//! Field-name translation between the local snake_case columns and the
//! remote camelCase document fields.
//!
//! The translation must round-trip every local column. Column names are
//! restricted to lowercase ASCII letters, digits, and single underscores
//! between word characters; [`is_round_trippable`] checks that property.

use serde_json::{Map, Value};

/// `order_items` → `orderItems`, `address_line1` → `addressLine1`.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// `orderItems` → `order_items`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// True when `camel_to_snake(snake_to_camel(name)) == name`.
pub fn is_round_trippable(name: &str) -> bool {
    camel_to_snake(&snake_to_camel(name)) == name
}

/// Translate every key of a local record to the remote convention.
pub fn to_remote(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (snake_to_camel(k), v.clone()))
        .collect()
}

/// Translate every key of a remote document to the local convention.
pub fn to_local(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (camel_to_snake(k), v.clone()))
        .collect()
}
