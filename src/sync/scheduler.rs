//! ReconcileScheduler — timer and trigger loop over `ReconcileEngine`.
//!
//! One loop task owns the periodic interval and the trigger channel. Each
//! trigger spawns at most one run; triggers that arrive while a run is in
//! flight are dropped, never queued.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::storage::traits::LocalStore;

use super::engine::ReconcileEngine;
use super::types::{ReconcileReport, Trigger};

const TRIGGER_CAPACITY: usize = 16;
const REPORT_CAPACITY: usize = 16;

// ============================================================================
// ReconcileScheduler
// ============================================================================

pub struct ReconcileScheduler {
    triggers: mpsc::Sender<Trigger>,
    reports: broadcast::Sender<Arc<ReconcileReport>>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_engine: Box<dyn Fn() + Send + Sync>,
}

impl ReconcileScheduler {
    /// Spawn the scheduling loop. The first timer run happens one interval
    /// after start; use [`Trigger::Manual`] for an immediate run.
    pub fn start<L: LocalStore + 'static>(engine: Arc<ReconcileEngine<L>>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let (report_tx, _) = broadcast::channel(REPORT_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_loop(
            Arc::clone(&engine),
            trigger_rx,
            stop_rx,
            report_tx.clone(),
        ));

        let shutdown_target = Arc::clone(&engine);
        Self {
            triggers: trigger_tx,
            reports: report_tx,
            stop: stop_tx,
            handle: Mutex::new(Some(handle)),
            shutdown_engine: Box::new(move || shutdown_target.shutdown()),
        }
    }

    /// Request a run. Returns `false` when the trigger queue is full or the
    /// scheduler has stopped.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        self.triggers.try_send(trigger).is_ok()
    }

    /// Sender for event sources such as the connectivity monitor.
    pub fn sender(&self) -> mpsc::Sender<Trigger> {
        self.triggers.clone()
    }

    /// Receive the report of every completed run.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ReconcileReport>> {
        self.reports.subscribe()
    }

    /// Cancel the current run at its next record boundary, stop the loop and
    /// wait for both to finish.
    pub async fn shutdown(&self) {
        (self.shutdown_engine)();
        let _ = self.stop.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        info!("reconcile scheduler stopped");
    }
}

async fn run_loop<L: LocalStore + 'static>(
    engine: Arc<ReconcileEngine<L>>,
    mut triggers: mpsc::Receiver<Trigger>,
    mut stop: watch::Receiver<bool>,
    reports: broadcast::Sender<Arc<ReconcileReport>>,
) {
    let period = engine.config().sync_interval();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        let trigger = tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => Trigger::Timer,
            received = triggers.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
        };

        if current.as_ref().is_some_and(|h| !h.is_finished()) || engine.is_running() {
            debug!(?trigger, "reconciliation in flight; trigger dropped");
            continue;
        }

        debug!(?trigger, "starting reconciliation");
        let engine = Arc::clone(&engine);
        let reports = reports.clone();
        current = Some(tokio::spawn(async move {
            match engine.reconcile().await {
                Ok(report) => {
                    let _ = reports.send(Arc::new(report));
                }
                Err(ReconcileError::AlreadyRunning) => {
                    debug!(?trigger, "reconciliation already running; trigger dropped");
                }
            }
        }));
    }

    if let Some(run) = current {
        let _ = run.await;
    }
}
