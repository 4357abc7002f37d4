//! Per-tenant `last_sync_time`, persisted in the local metadata table.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::clock;
use crate::error::Result;
use crate::storage::traits::LocalStore;

fn key(tenant: &str) -> String {
    format!("last_sync_time:{tenant}")
}

/// Last successful merge for `tenant`, if any.
pub fn load<L: LocalStore>(store: &L, tenant: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(store
        .get_meta(&key(tenant))?
        .and_then(|raw| clock::parse_timestamp(&Value::String(raw))))
}

pub fn save<L: LocalStore>(store: &L, tenant: &str, at: DateTime<Utc>) -> Result<()> {
    store.set_meta(&key(tenant), &clock::format_timestamp(at))
}
