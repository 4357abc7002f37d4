//! Full reconciliation runs against SQLite and the in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pos_sync::error::ReconcileError;
use pos_sync::{clock, naming};
use pos_sync::storage::tombstones;
use pos_sync::storage::traits::{LocalStore, RemoteStore};
use pos_sync::sync::{checkpoint, ReconcileEngine, ReconcileOptions, SyncErrorEvent, SyncErrorKind, SyncPhase};
use pos_sync::types::{Filter, Record, ORDERS, ORDER_ITEMS};
use pos_sync::{EngineConfig, MemoryRemote, SqliteStore, StaticTenant};
use serde_json::{json, Value};

use crate::common::{engine, item, order, store, ts, GatedRemote, StalledRemote, TENANT};

fn push_remote(remote: &MemoryRemote, table: &str, record: &Record) {
    remote.insert(
        TENANT,
        table,
        record.id(),
        Value::Object(naming::to_remote(record.fields())),
    );
}

fn local(store: &SqliteStore, table: &str, id: &str) -> Option<Record> {
    store.query(table, &Filter::id(id)).unwrap().into_iter().next()
}

#[tokio::test]
async fn offline_run_repairs_locally_and_queues_deletes() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    store
        .insert_or_replace(ORDERS, &order("ghost", "G1", 0.0, &ts(1)))
        .unwrap();
    remote.set_online(false);

    let engine = engine(&store, &remote, EngineConfig::default());
    let report = engine.reconcile().await.unwrap();

    assert!(!report.online);
    assert!(report.succeeded());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, SyncErrorKind::Connectivity);
    assert_eq!(report.errors[0].phase, SyncPhase::ConnectivityCheck);
    assert!(report.status_line().starts_with("Offline"));
    assert!(local(&store, ORDERS, "ghost").is_none());
    assert_eq!(tombstones::pending(store.as_ref(), ORDERS).unwrap(), vec!["ghost".to_string()]);
    assert_eq!(remote.writes(), 0);
    assert!(engine.status().last_sync_time.is_none());
}

#[tokio::test]
async fn merge_moves_the_later_side() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());

    // o1: local newer. o2: remote only. o3: local only. o4: tie.
    store
        .insert_or_replace(ORDERS, &order("o1", "A1", 5.0, &ts(5)))
        .unwrap();
    push_remote(&remote, ORDERS, &order("o1", "A1", 4.0, &ts(3)));
    push_remote(&remote, ORDERS, &order("o2", "A2", 6.0, &ts(4)));
    store
        .insert_or_replace(ORDERS, &order("o3", "A3", 7.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDERS, &order("o4", "A4", 8.0, &ts(2)))
        .unwrap();
    push_remote(&remote, ORDERS, &order("o4", "A4", 9.0, &ts(2)));

    let engine = engine(&store, &remote, EngineConfig::default());
    let report = engine.reconcile().await.unwrap();

    assert!(report.online);
    assert!(report.succeeded(), "errors: {:?}", report.errors);
    assert_eq!(report.merge.uploaded, 2);
    assert_eq!(report.merge.downloaded, 1);
    assert_eq!(report.merge.skipped_equal, 1);

    let o1 = remote.document(TENANT, ORDERS, "o1").unwrap();
    assert_eq!(o1.get("totalAmount"), Some(&json!(5.0)));
    assert_eq!(o1.get("updatedAt"), Some(&json!(ts(5))));
    assert!(remote.document(TENANT, ORDERS, "o3").is_some());
    assert_eq!(local(&store, ORDERS, "o2").unwrap().get_f64("total_amount"), Some(6.0));

    // Equal clocks move nothing, even with different content.
    assert_eq!(local(&store, ORDERS, "o4").unwrap().get_f64("total_amount"), Some(8.0));
    assert_eq!(
        remote.document(TENANT, ORDERS, "o4").unwrap().get("totalAmount"),
        Some(&json!(9.0))
    );

    let again = engine.reconcile().await.unwrap();
    assert_eq!(again.merge.uploaded, 0);
    assert_eq!(again.merge.downloaded, 0);
    assert_eq!(again.merge.skipped_equal, 4);
}

#[tokio::test]
async fn successful_run_saves_checkpoint() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    let engine = engine(&store, &remote, EngineConfig::default());

    let report = engine.reconcile().await.unwrap();
    assert!(report.succeeded());
    assert!(report.validation.is_clean());

    let saved = checkpoint::load(store.as_ref(), TENANT).unwrap().unwrap();
    let in_memory = engine.status().last_sync_time.unwrap();
    // Persisted with millisecond precision.
    assert_eq!(clock::format_timestamp(in_memory), clock::format_timestamp(saved));
    assert_eq!(engine.status().phase, SyncPhase::Idle);
    assert!(!engine.status().running);
}

#[tokio::test]
async fn local_ghost_is_deleted_remotely_and_not_resurrected() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    let ghost = order("ghost", "G1", 0.0, &ts(1));
    store.insert_or_replace(ORDERS, &ghost).unwrap();
    push_remote(&remote, ORDERS, &ghost);

    let engine = engine(&store, &remote, EngineConfig::default());
    let report = engine.reconcile().await.unwrap();

    assert_eq!(report.remote_repair.deleted, 1);
    assert_eq!(report.remote_repair.pending, 0);
    assert!(remote.document(TENANT, ORDERS, "ghost").is_none());
    assert!(local(&store, ORDERS, "ghost").is_none());
    assert_eq!(report.merge.downloaded, 0);
    assert!(tombstones::all_pending(store.as_ref()).unwrap().is_empty());
}

#[tokio::test]
async fn remote_only_ghosts_are_swept() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    push_remote(&remote, ORDERS, &order("rg", "R1", 0.0, &ts(1)));
    push_remote(&remote, ORDERS, &order("live", "R2", 0.0, &ts(1)));
    push_remote(&remote, ORDER_ITEMS, &item("i1", "live", "m1", 1, 0.0));

    let engine = engine(&store, &remote, EngineConfig::default());
    let report = engine.reconcile().await.unwrap();

    assert_eq!(report.remote_repair.remote_ghosts, 1);
    assert!(remote.document(TENANT, ORDERS, "rg").is_none());
    assert!(local(&store, ORDERS, "rg").is_none());
    assert!(local(&store, ORDERS, "live").is_some());
}

#[tokio::test]
async fn interrupted_deletion_resumes_on_next_run() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    for n in 1..=5 {
        let ghost = order(&format!("g{n}"), &format!("G{n}"), 0.0, &ts(1));
        store.insert_or_replace(ORDERS, &ghost).unwrap();
        push_remote(&remote, ORDERS, &ghost);
    }
    let config = EngineConfig {
        remote_batch_limit: 2,
        ..EngineConfig::default()
    };
    let engine = engine(&store, &remote, config);

    remote.fail_next_batches(1);
    let failed = engine.reconcile().await.unwrap();
    assert!(!failed.succeeded());
    assert_eq!(failed.final_phase, SyncPhase::Failed);
    assert!(failed.sync_error.is_some());
    assert!(engine.status().sync_error.is_some());
    assert_eq!(engine.status().phase, SyncPhase::Idle);
    assert_eq!(remote.len(TENANT, ORDERS), 5);
    assert_eq!(tombstones::pending(store.as_ref(), ORDERS).unwrap().len(), 5);
    assert!(engine.status().last_sync_time.is_none());

    let resumed = engine.reconcile().await.unwrap();
    assert!(resumed.succeeded(), "errors: {:?}", resumed.errors);
    assert_eq!(resumed.remote_repair.deleted, 5);
    assert_eq!(resumed.remote_repair.batches, 3);
    assert_eq!(remote.batch_commits(), 3);
    assert_eq!(remote.len(TENANT, ORDERS), 0);
    assert!(engine.status().sync_error.is_none());
}

#[tokio::test]
async fn queued_ids_are_never_downloaded() {
    let store = store();
    // Every remote commit is rejected as too large for the configured chunk.
    let remote = Arc::new(MemoryRemote::new().with_batch_limit(1));
    for id in ["g1", "g2"] {
        let ghost = order(id, id, 0.0, &ts(1));
        store.insert_or_replace(ORDERS, &ghost).unwrap();
        push_remote(&remote, ORDERS, &ghost);
    }
    let config = EngineConfig {
        remote_batch_limit: 2,
        ..EngineConfig::default()
    };
    let engine = engine(&store, &remote, config);
    let report = engine.reconcile().await.unwrap();

    assert!(report.errors.iter().all(|e| e.kind == SyncErrorKind::Storage));
    assert!(!report.errors.is_empty());
    assert_eq!(report.merge.skipped_pending, 2);
    assert_eq!(report.merge.downloaded, 0);
    assert!(local(&store, ORDERS, "g1").is_none());
    assert_eq!(report.remote_repair.pending, 2);
}

#[tokio::test]
async fn callbacks_observe_phases_and_panics_are_contained() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);
    let phases: Arc<Mutex<Vec<SyncPhase>>> = Arc::default();
    let seen = Arc::clone(&phases);

    let remote_dyn: Arc<dyn RemoteStore> = remote.clone();
    let mut options = ReconcileOptions::new(
        Arc::clone(&store),
        remote_dyn,
        Arc::new(StaticTenant::new(TENANT)),
    );
    options.on_phase = Some(Arc::new(move |phase: SyncPhase| seen.lock().push(phase)));
    options.on_error = Some(Arc::new(|_event: &SyncErrorEvent| panic!("callback bug")));
    let engine = ReconcileEngine::new(options);

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        *phases.lock(),
        vec![
            SyncPhase::ConnectivityCheck,
            SyncPhase::LocalRepair,
            SyncPhase::Validation,
            SyncPhase::Idle,
        ]
    );
}

#[tokio::test]
async fn no_tenant_means_local_only_without_errors() {
    let store = store();
    let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemote::new());
    let engine = ReconcileEngine::new(ReconcileOptions::new(
        Arc::clone(&store),
        remote,
        Arc::new(StaticTenant(None)),
    ));
    let report = engine.reconcile().await.unwrap();
    assert!(report.tenant.is_none());
    assert!(!report.online);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn shut_down_engine_refuses_work() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    store
        .insert_or_replace(ORDERS, &order("ghost", "G1", 0.0, &ts(1)))
        .unwrap();
    let engine = engine(&store, &remote, EngineConfig::default());
    engine.shutdown();

    let report = engine.reconcile().await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.status_line(), "Sync cancelled");
    assert!(local(&store, ORDERS, "ghost").is_some());
}

#[tokio::test]
async fn engine_reconstructs_orphans_on_request() {
    let store = store();
    let remote = Arc::new(MemoryRemote::new());
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "X", "m1", 2, 5.0))
        .unwrap();
    let engine = engine(&store, &remote, EngineConfig::default());

    assert_eq!(engine.reconstruct_orphans().unwrap(), 1);
    assert_eq!(engine.reconstruct_orphans().unwrap(), 0);
    assert_eq!(local(&store, ORDERS, "X").unwrap().get_f64("total_amount"), Some(10.0));
}

// ----------------------------------------------------------------------------
// Concurrency
// ----------------------------------------------------------------------------

#[tokio::test]
async fn overlapping_runs_are_rejected() {
    let store = store();
    let remote = Arc::new(GatedRemote::new(MemoryRemote::new()));
    let remote_dyn: Arc<dyn RemoteStore> = remote.clone();
    let engine = Arc::new(ReconcileEngine::new(ReconcileOptions::new(
        Arc::clone(&store),
        remote_dyn,
        Arc::new(StaticTenant::new(TENANT)),
    )));

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.reconcile().await }
    });
    while !engine.is_running() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(engine.reconcile().await, Err(ReconcileError::AlreadyRunning)));
    assert!(matches!(engine.reconstruct_orphans(), Err(ReconcileError::AlreadyRunning)));

    remote.release();
    let report = first.await.unwrap().unwrap();
    assert!(report.succeeded());
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn stalled_remote_read_fails_the_run() {
    let store = store();
    store
        .insert_or_replace(ORDERS, &order("o1", "A1", 5.0, &ts(1)))
        .unwrap();
    store
        .insert_or_replace(ORDER_ITEMS, &item("i1", "o1", "m1", 1, 5.0))
        .unwrap();
    let remote: Arc<dyn RemoteStore> = Arc::new(StalledRemote { inner: MemoryRemote::new() });
    let config = EngineConfig {
        remote_timeout_secs: 5,
        ..EngineConfig::default()
    };
    let engine = ReconcileEngine::new(
        ReconcileOptions::new(Arc::clone(&store), remote, Arc::new(StaticTenant::new(TENANT)))
            .with_config(config),
    );

    let report = tokio::time::timeout(Duration::from_secs(3600), engine.reconcile())
        .await
        .expect("reconcile must not hang on a stalled read")
        .unwrap();

    assert!(report.online);
    assert_eq!(report.final_phase, SyncPhase::Failed);
    assert!(report.sync_error.as_deref().unwrap().contains("timed out after 5s"));
    assert!(report
        .errors
        .iter()
        .any(|e| e.phase == SyncPhase::RemoteConnectionRepair && e.kind == SyncErrorKind::Connectivity));
    assert_eq!(engine.status().phase, SyncPhase::Idle);
    assert!(!engine.is_running());
    assert!(checkpoint::load(store.as_ref(), TENANT).unwrap().is_none());
}
