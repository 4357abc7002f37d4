//! Reconciliation phases, reports, error events and engine options.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::repair::{AnomalyCounts, RepairReport};
use crate::storage::traits::{LocalStore, RemoteStore, TenantResolver};

// ============================================================================
// Phases
// ============================================================================

/// State of the reconciliation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    ConnectivityCheck,
    LocalRepair,
    RemoteConnectionRepair,
    TimestampMerge,
    Validation,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::ConnectivityCheck => "connectivity_check",
            SyncPhase::LocalRepair => "local_repair",
            SyncPhase::RemoteConnectionRepair => "remote_connection_repair",
            SyncPhase::TimestampMerge => "timestamp_merge",
            SyncPhase::Validation => "validation",
            SyncPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Classification of non-fatal reconciliation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Transport unreachable or timed out. Retried on the next run.
    Connectivity,
    /// Schema descriptor could not be written. Advisory.
    Schema,
    /// A record violates an invariant and could not be repaired.
    Constraint,
    /// Two writers touched the same record. Resolved by timestamp.
    Conflict,
    /// Local or remote storage rejected an operation.
    Storage,
    /// Remote store has nothing to recover from.
    RecoveryUnavailable,
}

/// An error event, collected in reports and never thrown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub table: Option<String>,
    pub id: Option<String>,
    pub error: String,
    pub kind: SyncErrorKind,
}

/// Callback type for error events.
pub type SyncErrorCallback = dyn Fn(&SyncErrorEvent) + Send + Sync;

/// Callback type for phase transitions.
pub type PhaseCallback = dyn Fn(SyncPhase) + Send + Sync;

// ============================================================================
// Reports
// ============================================================================

/// Outcome of the timestamp merge phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub uploaded: usize,
    pub downloaded: usize,
    /// Same `updated_at` on both sides; nothing moved.
    pub skipped_equal: usize,
    /// Ids awaiting remote deletion; not re-downloaded.
    pub skipped_pending: usize,
    pub failed: usize,
}

impl MergeStats {
    pub fn merge(&mut self, other: &MergeStats) {
        self.uploaded += other.uploaded;
        self.downloaded += other.downloaded;
        self.skipped_equal += other.skipped_equal;
        self.skipped_pending += other.skipped_pending;
        self.failed += other.failed;
    }
}

/// Outcome of the remote connection repair phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteRepairStats {
    /// Queued deletions committed remotely.
    pub deleted: usize,
    /// Batches committed.
    pub batches: usize,
    /// Queued deletions still pending after this run.
    pub pending: usize,
    /// Remote-only ghost orders removed.
    pub remote_ghosts: usize,
}

/// Full account of one reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub tenant: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub online: bool,
    /// `Idle` on success, `Failed` when a phase aborted.
    pub final_phase: SyncPhase,
    pub repair: RepairReport,
    pub remote_repair: RemoteRepairStats,
    pub merge: MergeStats,
    pub validation: AnomalyCounts,
    pub errors: Vec<SyncErrorEvent>,
    /// Set when a phase aborted the run.
    pub sync_error: Option<String>,
    pub cancelled: bool,
}

impl ReconcileReport {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            tenant: None,
            started_at,
            finished_at: started_at,
            online: false,
            final_phase: SyncPhase::Idle,
            repair: RepairReport::default(),
            remote_repair: RemoteRepairStats::default(),
            merge: MergeStats::default(),
            validation: AnomalyCounts::default(),
            errors: Vec::new(),
            sync_error: None,
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_phase == SyncPhase::Idle && !self.cancelled
    }

    pub fn attempted(&self) -> usize {
        self.repair.attempted()
            + self.remote_repair.deleted
            + self.remote_repair.remote_ghosts
            + self.merge.uploaded
            + self.merge.downloaded
            + self.merge.failed
    }

    pub fn fixed(&self) -> usize {
        self.repair.fixed() + self.remote_repair.deleted + self.remote_repair.remote_ghosts
    }

    pub fn failed(&self) -> usize {
        self.repair.failed() + self.merge.failed
    }

    /// One-line human-readable summary.
    pub fn status_line(&self) -> String {
        if self.cancelled {
            return "Sync cancelled".to_string();
        }
        if let Some(ref error) = self.sync_error {
            return format!("Sync failed: {error}");
        }
        if !self.online {
            return format!(
                "Offline: local repair only ({} fixed, {} failed)",
                self.repair.fixed(),
                self.repair.failed()
            );
        }
        format!(
            "Sync complete: {} uploaded, {} downloaded, {} fixed, {} failed",
            self.merge.uploaded,
            self.merge.downloaded,
            self.fixed(),
            self.failed()
        )
    }
}

/// Observable engine state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub phase: SyncPhase,
    pub running: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub last_status: Option<String>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            running: false,
            last_sync_time: None,
            sync_error: None,
            last_status: None,
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Collaborators and settings of a [`ReconcileEngine`](super::engine::ReconcileEngine).
pub struct ReconcileOptions<L: LocalStore> {
    pub local: Arc<L>,
    pub remote: Arc<dyn RemoteStore>,
    pub tenant: Arc<dyn TenantResolver>,
    pub config: EngineConfig,
    /// Called for each error event.
    pub on_error: Option<Arc<SyncErrorCallback>>,
    /// Called on every phase transition.
    pub on_phase: Option<Arc<PhaseCallback>>,
}

impl<L: LocalStore> ReconcileOptions<L> {
    pub fn new(local: Arc<L>, remote: Arc<dyn RemoteStore>, tenant: Arc<dyn TenantResolver>) -> Self {
        Self {
            local,
            remote,
            tenant,
            config: EngineConfig::default(),
            on_error: None,
            on_phase: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

/// Why a reconciliation was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    ConnectivityRestored,
    Manual,
}
