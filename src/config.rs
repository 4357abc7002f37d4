//! Engine configuration.
//!
//! Loaded from JSON (all fields optional) or built in code from
//! `EngineConfig::default()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PosSyncError, Result};
use crate::types::DEFAULT_SYNCED_TABLES;

/// Hard ceiling on operations per remote batch commit.
pub const MAX_REMOTE_BATCH: usize = 500;

pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;

/// What the repair pass does with order items whose order is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Delete orphaned items.
    #[default]
    Delete,
    /// Synthesize parent orders from the orphans instead of deleting them.
    Reconstruct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval of the periodic reconciliation timer.
    pub sync_interval_secs: u64,
    /// Upper bound for the connectivity probe.
    pub probe_timeout_secs: u64,
    /// Upper bound for every other remote call. An elapsed bound counts as
    /// a connectivity failure.
    pub remote_timeout_secs: u64,
    /// Operations per remote batched delete (clamped to 1..=500).
    pub remote_batch_limit: usize,
    /// Tolerance when comparing order totals against their items.
    pub total_epsilon: f64,
    /// Tax rate applied to reconstructed orders.
    pub tax_rate: f64,
    /// Identity written into orders that lost their `user_id`.
    pub fallback_user_id: String,
    /// Tables reconciled with the remote store, in merge order.
    pub synced_tables: Vec<String>,
    pub orphan_policy: OrphanPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            probe_timeout_secs: 10,
            remote_timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
            remote_batch_limit: MAX_REMOTE_BATCH,
            total_epsilon: 0.01,
            tax_rate: 0.13,
            fallback_user_id: "admin".to_string(),
            synced_tables: DEFAULT_SYNCED_TABLES.iter().map(|t| t.to_string()).collect(),
            orphan_policy: OrphanPolicy::Delete,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| PosSyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            return Err(PosSyncError::Config(
                "sync_interval_secs must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.tax_rate) {
            return Err(PosSyncError::Config(format!(
                "tax_rate must be in [0, 1), got {}",
                self.tax_rate
            )));
        }
        if self.total_epsilon < 0.0 {
            return Err(PosSyncError::Config(
                "total_epsilon must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs.max(1))
    }

    /// Effective chunk size for remote batched deletes.
    pub fn batch_limit(&self) -> usize {
        self.remote_batch_limit.clamp(1, MAX_REMOTE_BATCH)
    }
}
