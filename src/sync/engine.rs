//! ReconcileEngine — the reconciliation state machine.
//!
//! `Idle → ConnectivityCheck → LocalRepair → RemoteConnectionRepair →
//! TimestampMerge → Validation → Idle | Failed`. Local repair always runs;
//! the remote phases run only when the probe succeeded. Errors are collected
//! in the report. The only error returned to callers is
//! [`ReconcileError::AlreadyRunning`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::EngineConfig;
use crate::error::{ReconcileError, RemoteError};
use crate::recovery::reconstruct::ReconstructionEngine;
use crate::repair::checks::{self, AnomalyCounts, StoreView};
use crate::repair::RepairPass;
use crate::schema::SchemaMirror;
use crate::storage::tombstones;
use crate::storage::traits::{bounded, LocalStore, RemoteStore, TenantResolver};
use crate::types::{ORDERS, ORDER_ITEMS, SCHEMA_SENTINEL_ID};

use super::checkpoint;
use super::merge::{self, MergePlan};
use super::types::*;

// ============================================================================
// In-flight guard
// ============================================================================

/// Holds an in-flight flag for the lifetime of one run.
pub(crate) struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    /// `None` when another run holds the flag.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Marker for a phase that stopped the run.
struct Abort;

// ============================================================================
// ReconcileEngine
// ============================================================================

pub struct ReconcileEngine<L: LocalStore> {
    local: Arc<L>,
    remote: Arc<dyn RemoteStore>,
    tenant: Arc<dyn TenantResolver>,
    config: EngineConfig,
    on_error: Option<Arc<SyncErrorCallback>>,
    on_phase: Option<Arc<PhaseCallback>>,
    running: AtomicBool,
    cancel: AtomicBool,
    shut_down: AtomicBool,
    status: Mutex<EngineStatus>,
}

impl<L: LocalStore> ReconcileEngine<L> {
    pub fn new(options: ReconcileOptions<L>) -> Self {
        Self {
            local: options.local,
            remote: options.remote,
            tenant: options.tenant,
            config: options.config,
            on_error: options.on_error,
            on_phase: options.on_phase,
            running: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            status: Mutex::new(EngineStatus::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load the checkpoint of the current tenant and mirror the schema when
    /// the remote store is reachable. Never fails; problems are logged.
    pub async fn init(&self) {
        let Some(tenant) = self.tenant.current_tenant() else {
            debug!("no active tenant; skipping engine init");
            return;
        };
        match checkpoint::load(self.local.as_ref(), &tenant) {
            Ok(last) => self.status.lock().last_sync_time = last,
            Err(e) => warn!(tenant = %tenant, error = %e, "failed to load sync checkpoint"),
        }
        if self.probe().await.is_ok() {
            if let Err(e) = self.mirror_schema(&tenant).await {
                debug!(tenant = %tenant, error = %e, "schema mirror skipped during init");
            }
        }
    }

    /// Stop the current run at the next record boundary and refuse new runs.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stop the current run at the next record boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        self.status.lock().clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    /// Write schema descriptors for every local table.
    pub async fn mirror_schema(&self, tenant: &str) -> Result<(), crate::error::SchemaError> {
        let result = SchemaMirror::new(Arc::clone(&self.local), Arc::clone(&self.remote))
            .with_timeout(self.config.remote_timeout())
            .materialize(tenant)
            .await;
        if let Err(ref e) = result {
            self.make_error(SyncPhase::Idle, None, None, e, SyncErrorKind::Schema);
        }
        result
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Run one full reconciliation. Rejected while another run (or an
    /// orphan reconstruction) is in flight.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _guard = InFlight::acquire(&self.running).ok_or(ReconcileError::AlreadyRunning)?;
        self.status.lock().running = true;

        let mut report = ReconcileReport::new(clock::now());
        if self.is_shut_down() {
            report.cancelled = true;
        } else {
            self.cancel.store(false, Ordering::SeqCst);
            let outcome = self.run_phases(&mut report).await;
            if outcome.is_err() && !report.cancelled {
                report.final_phase = SyncPhase::Failed;
                self.set_phase(SyncPhase::Failed);
            }
        }
        report.finished_at = clock::now();
        self.finish(&report);
        Ok(report)
    }

    async fn run_phases(&self, report: &mut ReconcileReport) -> Result<(), Abort> {
        // ConnectivityCheck
        self.set_phase(SyncPhase::ConnectivityCheck);
        let tenant = self.tenant.current_tenant();
        report.tenant = tenant.clone();
        let online = match tenant {
            None => {
                debug!("no active tenant; running local repair only");
                false
            }
            Some(_) => match self.probe().await {
                Ok(()) => true,
                Err(e) => {
                    self.push_error(report, SyncPhase::ConnectivityCheck, None, None, &e, SyncErrorKind::Connectivity);
                    false
                }
            },
        };
        report.online = online;

        // LocalRepair
        self.set_phase(SyncPhase::LocalRepair);
        report.repair = RepairPass::new(self.local.as_ref(), &self.config)
            .with_cancel(&self.cancel)
            .run_all();
        for failure in report.repair.failures().cloned().collect::<Vec<_>>() {
            self.push_error(
                report,
                SyncPhase::LocalRepair,
                Some(&failure.table),
                failure.id.as_deref(),
                &format!("{}: {}", failure.op, failure.error),
                SyncErrorKind::Constraint,
            );
        }
        self.check_cancel(report)?;

        if let (true, Some(tenant)) = (online, tenant.as_deref()) {
            self.set_phase(SyncPhase::RemoteConnectionRepair);
            self.remote_connection_repair(tenant, report).await?;
            self.check_cancel(report)?;

            self.set_phase(SyncPhase::TimestampMerge);
            self.timestamp_merge(tenant, report).await?;

            let now = clock::now();
            match checkpoint::save(self.local.as_ref(), tenant, now) {
                Ok(()) => self.status.lock().last_sync_time = Some(now),
                Err(e) => self.push_error(report, SyncPhase::TimestampMerge, None, None, &e, SyncErrorKind::Storage),
            }
        }

        // Validation
        self.set_phase(SyncPhase::Validation);
        match StoreView::load(self.local.as_ref()) {
            Ok(view) => {
                report.validation = AnomalyCounts::collect(&view, self.config.total_epsilon);
                if !report.validation.is_clean() {
                    warn!(violations = report.validation.violations(), "anomalies remain after reconciliation");
                }
            }
            Err(e) => self.push_error(report, SyncPhase::Validation, None, None, &e, SyncErrorKind::Storage),
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        bounded(self.config.probe_timeout(), "connectivity probe", self.remote.probe()).await
    }

    // -----------------------------------------------------------------------
    // RemoteConnectionRepair
    // -----------------------------------------------------------------------

    async fn remote_connection_repair(
        &self,
        tenant: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), Abort> {
        let phase = SyncPhase::RemoteConnectionRepair;
        let queued = match tombstones::all_pending(self.local.as_ref()) {
            Ok(queued) => queued,
            Err(e) => {
                self.push_error(report, phase, None, None, &e, SyncErrorKind::Storage);
                return Ok(());
            }
        };

        for (table, ids) in &queued {
            for chunk in ids.chunks(self.config.batch_limit()) {
                self.check_cancel(report)?;
                let call = self.remote.batched_delete(tenant, table, chunk);
                match bounded(self.config.remote_timeout(), "batched delete", call).await {
                    Ok(()) => {
                        report.remote_repair.batches += 1;
                        report.remote_repair.deleted += chunk.len();
                        if let Err(e) = tombstones::clear(self.local.as_ref(), table, chunk) {
                            self.push_error(report, phase, Some(table), None, &e, SyncErrorKind::Storage);
                        }
                    }
                    Err(e) => {
                        let kind = error_kind(&e);
                        self.push_error(report, phase, Some(table), None, &e, kind);
                        if e.is_connectivity() {
                            return self.abort(report, e);
                        }
                    }
                }
            }
        }
        report.remote_repair.pending = tombstones::all_pending(self.local.as_ref())
            .map(|q| q.values().map(Vec::len).sum())
            .unwrap_or(0);
        info!(
            tenant,
            deleted = report.remote_repair.deleted,
            batches = report.remote_repair.batches,
            pending = report.remote_repair.pending,
            "propagated queued deletions"
        );

        self.sweep_remote_ghosts(tenant, report).await
    }

    /// Delete remote orders with zero total and no items on either side
    /// that have no live local counterpart.
    async fn sweep_remote_ghosts(&self, tenant: &str, report: &mut ReconcileReport) -> Result<(), Abort> {
        let phase = SyncPhase::RemoteConnectionRepair;
        let limit = self.config.remote_timeout();
        let fetched = async {
            let orders = self.remote.get_collection(tenant, ORDERS);
            let orders = bounded(limit, "collection read", orders).await?;
            let items = self.remote.get_collection(tenant, ORDER_ITEMS);
            let items = bounded(limit, "collection read", items).await?;
            Ok::<_, RemoteError>((orders, items))
        }
        .await;
        let (remote_orders, remote_items) = match fetched {
            Ok(pair) => pair,
            Err(e) => {
                let kind = error_kind(&e);
                self.push_error(report, phase, Some(ORDERS), None, &e, kind);
                return if e.is_connectivity() { self.abort(report, e) } else { Ok(()) };
            }
        };
        let view = match StoreView::load(self.local.as_ref()) {
            Ok(view) => view,
            Err(e) => {
                self.push_error(report, phase, Some(ORDERS), None, &e, SyncErrorKind::Storage);
                return Ok(());
            }
        };

        let mut referenced: HashSet<String> = remote_items
            .iter()
            .filter_map(|doc| merge::to_local_record(doc).get_str("order_id").map(str::to_string))
            .collect();
        referenced.extend(view.items_by_order().keys().map(|id| id.to_string()));
        let local_orders = view.order_ids();

        let ghosts: Vec<String> = remote_orders
            .iter()
            .filter(|doc| doc.id != SCHEMA_SENTINEL_ID)
            .map(merge::to_local_record)
            .filter(|order| {
                checks::is_zero(order.get_f64("total_amount").unwrap_or(0.0))
                    && !referenced.contains(order.id())
                    && !local_orders.contains(order.id())
            })
            .map(|order| order.id().to_string())
            .collect();

        for chunk in ghosts.chunks(self.config.batch_limit()) {
            self.check_cancel(report)?;
            let call = self.remote.batched_delete(tenant, ORDERS, chunk);
            match bounded(limit, "batched delete", call).await {
                Ok(()) => {
                    report.remote_repair.batches += 1;
                    report.remote_repair.remote_ghosts += chunk.len();
                }
                Err(e) => {
                    let kind = error_kind(&e);
                    self.push_error(report, phase, Some(ORDERS), None, &e, kind);
                    if e.is_connectivity() {
                        return self.abort(report, e);
                    }
                }
            }
        }
        if report.remote_repair.remote_ghosts > 0 {
            info!(tenant, removed = report.remote_repair.remote_ghosts, "swept remote ghost orders");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // TimestampMerge
    // -----------------------------------------------------------------------

    async fn timestamp_merge(&self, tenant: &str, report: &mut ReconcileReport) -> Result<(), Abort> {
        let phase = SyncPhase::TimestampMerge;
        let limit = self.config.remote_timeout();
        for table in &self.config.synced_tables {
            self.check_cancel(report)?;
            let local = match self.local.query(table, &crate::types::Filter::All) {
                Ok(rows) => rows,
                Err(e) => {
                    self.push_error(report, phase, Some(table), None, &e, SyncErrorKind::Storage);
                    continue;
                }
            };
            let call = self.remote.get_collection(tenant, table);
            let remote = match bounded(limit, "collection read", call).await {
                Ok(docs) => docs,
                Err(e) => {
                    let kind = error_kind(&e);
                    self.push_error(report, phase, Some(table), None, &e, kind);
                    if e.is_connectivity() {
                        return self.abort(report, e);
                    }
                    continue;
                }
            };
            let pending = match tombstones::pending_set(self.local.as_ref(), table) {
                Ok(pending) => pending,
                Err(e) => {
                    self.push_error(report, phase, Some(table), None, &e, SyncErrorKind::Storage);
                    continue;
                }
            };

            let plan = MergePlan::build(local, &remote, &pending);
            let mut stats = MergeStats {
                skipped_equal: plan.skipped_equal.len(),
                skipped_pending: plan.skipped_pending.len(),
                ..MergeStats::default()
            };
            for id in &plan.skipped_equal {
                debug!(table = %table, id = %id, "timestamps equal; skipped");
            }

            for record in &plan.uploads {
                self.check_cancel(report)?;
                let data = merge::to_remote_fields(record);
                let call = self.remote.set_document(tenant, table, record.id(), &data, true);
                match bounded(limit, "document write", call).await {
                    Ok(()) => stats.uploaded += 1,
                    Err(e) => {
                        stats.failed += 1;
                        let kind = error_kind(&e);
                        self.push_error(report, phase, Some(table), Some(record.id()), &e, kind);
                        if e.is_connectivity() {
                            report.merge.merge(&stats);
                            return self.abort(report, e);
                        }
                    }
                }
            }

            for record in &plan.downloads {
                self.check_cancel(report)?;
                match self.local.transaction(|s| s.insert_or_replace(table, record)) {
                    Ok(()) => stats.downloaded += 1,
                    Err(e) => {
                        stats.failed += 1;
                        self.push_error(report, phase, Some(table), Some(record.id()), &e, SyncErrorKind::Storage);
                    }
                }
            }

            info!(
                tenant,
                table = %table,
                uploaded = stats.uploaded,
                downloaded = stats.downloaded,
                skipped_equal = stats.skipped_equal,
                skipped_pending = stats.skipped_pending,
                failed = stats.failed,
                "merged table"
            );
            report.merge.merge(&stats);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconstruction
    // -----------------------------------------------------------------------

    /// Synthesize and persist orders for orphaned items. Shares the
    /// reconciliation guard so it never races orphan deletion.
    pub fn reconstruct_orphans(&self) -> Result<usize, ReconcileError> {
        let _guard = InFlight::acquire(&self.running).ok_or(ReconcileError::AlreadyRunning)?;
        let engine = ReconstructionEngine::new(
            Arc::clone(&self.local),
            self.config.tax_rate,
            self.config.fallback_user_id.clone(),
        );
        match engine.reconstruct_orphans() {
            Ok(orders) => Ok(engine.persist(&orders)),
            Err(e) => {
                self.make_error(SyncPhase::LocalRepair, Some(ORDERS), None, &e, SyncErrorKind::Storage);
                Ok(0)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn check_cancel(&self, report: &mut ReconcileReport) -> Result<(), Abort> {
        if self.cancel.load(Ordering::SeqCst) {
            info!("reconciliation cancelled");
            report.cancelled = true;
            return Err(Abort);
        }
        Ok(())
    }

    fn abort(&self, report: &mut ReconcileReport, error: RemoteError) -> Result<(), Abort> {
        warn!(error = %error, "reconciliation phase aborted");
        report.sync_error = Some(error.to_string());
        Err(Abort)
    }

    fn finish(&self, report: &ReconcileReport) {
        let line = report.status_line();
        {
            let mut status = self.status.lock();
            status.running = false;
            status.phase = SyncPhase::Idle;
            status.sync_error = report.sync_error.clone();
            status.last_status = Some(line.clone());
        }
        self.fire_phase(SyncPhase::Idle);
        info!(status = %line, "reconciliation finished");
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.lock().phase = phase;
        debug!(phase = %phase, "entering phase");
        self.fire_phase(phase);
    }

    fn fire_phase(&self, phase: SyncPhase) {
        if let Some(ref on_phase) = self.on_phase {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_phase(phase);
            }));
        }
    }

    fn push_error(
        &self,
        report: &mut ReconcileReport,
        phase: SyncPhase,
        table: Option<&str>,
        id: Option<&str>,
        error: &dyn fmt::Display,
        kind: SyncErrorKind,
    ) {
        let event = self.make_error(phase, table, id, error, kind);
        report.errors.push(event);
    }

    fn make_error(
        &self,
        phase: SyncPhase,
        table: Option<&str>,
        id: Option<&str>,
        error: &dyn fmt::Display,
        kind: SyncErrorKind,
    ) -> SyncErrorEvent {
        let event = SyncErrorEvent {
            phase,
            table: table.map(str::to_string),
            id: id.map(str::to_string),
            error: error.to_string(),
            kind,
        };
        debug!(phase = %phase, table, id, kind = ?kind, error = %event.error, "sync error");
        if let Some(ref on_error) = self.on_error {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_error(&event);
            }));
        }
        event
    }
}

fn error_kind(e: &RemoteError) -> SyncErrorKind {
    if e.is_connectivity() {
        SyncErrorKind::Connectivity
    } else {
        SyncErrorKind::Storage
    }
}
