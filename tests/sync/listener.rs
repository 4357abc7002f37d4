//! Remote change events applied between full runs.

use std::sync::Arc;
use std::time::Duration;

use pos_sync::naming;
use pos_sync::storage::tombstones;
use pos_sync::storage::traits::{ChangeKind, LocalStore, RemoteChange, RemoteDocument, RemoteStore};
use pos_sync::sync::{ChangeListener, ChangeOutcome};
use pos_sync::types::{Filter, Record, ORDERS, SCHEMA_SENTINEL_ID};
use pos_sync::{MemoryRemote, SqliteStore};

use crate::common::{order, store, ts, TENANT};

fn change(kind: ChangeKind, tenant: &str, record: &Record) -> RemoteChange {
    RemoteChange {
        kind,
        tenant: tenant.to_string(),
        table: ORDERS.to_string(),
        document: RemoteDocument {
            id: record.id().to_string(),
            data: naming::to_remote(record.fields()),
        },
    }
}

fn listener(store: &Arc<SqliteStore>) -> ChangeListener<SqliteStore> {
    ChangeListener::new(Arc::clone(store), TENANT, [ORDERS])
}

fn total(store: &SqliteStore, id: &str) -> Option<f64> {
    store
        .query(ORDERS, &Filter::id(id))
        .unwrap()
        .first()
        .and_then(|o| o.get_f64("total_amount"))
}

#[test]
fn newer_remote_versions_are_applied() {
    let store = store();
    store
        .insert_or_replace(ORDERS, &order("o1", "A1", 5.0, &ts(5)))
        .unwrap();
    let listener = listener(&store);

    let older = change(ChangeKind::Modified, TENANT, &order("o1", "A1", 1.0, &ts(4)));
    assert_eq!(listener.apply(&older).unwrap(), ChangeOutcome::Ignored);
    assert_eq!(total(&store, "o1"), Some(5.0));

    let newer = change(ChangeKind::Modified, TENANT, &order("o1", "A1", 9.0, &ts(6)));
    assert_eq!(listener.apply(&newer).unwrap(), ChangeOutcome::Applied);
    assert_eq!(total(&store, "o1"), Some(9.0));

    let added = change(ChangeKind::Added, TENANT, &order("o2", "A2", 3.0, &ts(1)));
    assert_eq!(listener.apply(&added).unwrap(), ChangeOutcome::Applied);
    assert_eq!(total(&store, "o2"), Some(3.0));
}

#[test]
fn foreign_and_sentinel_events_are_ignored() {
    let store = store();
    let listener = listener(&store);

    let other_tenant = change(ChangeKind::Added, "elsewhere", &order("o1", "A1", 1.0, &ts(1)));
    assert_eq!(listener.apply(&other_tenant).unwrap(), ChangeOutcome::Ignored);

    let sentinel = change(ChangeKind::Added, TENANT, &Record::new(SCHEMA_SENTINEL_ID));
    assert_eq!(listener.apply(&sentinel).unwrap(), ChangeOutcome::Ignored);
    assert_eq!(store.count(ORDERS, &Filter::All).unwrap(), 0);
}

#[test]
fn queued_deletions_are_not_resurrected() {
    let store = store();
    tombstones::enqueue(store.as_ref(), ORDERS, &["ghost".to_string()]).unwrap();
    let listener = listener(&store);

    let echo = change(ChangeKind::Modified, TENANT, &order("ghost", "G1", 0.0, &ts(9)));
    assert_eq!(listener.apply(&echo).unwrap(), ChangeOutcome::Ignored);
    assert!(total(&store, "ghost").is_none());

    // Once the remote removal is observed the queue entry is settled.
    let removed = change(ChangeKind::Removed, TENANT, &order("ghost", "G1", 0.0, &ts(9)));
    assert_eq!(listener.apply(&removed).unwrap(), ChangeOutcome::Ignored);
    assert!(tombstones::pending(store.as_ref(), ORDERS).unwrap().is_empty());
}

#[test]
fn removal_yields_to_a_newer_local_edit() {
    let store = store();
    store
        .insert_or_replace(ORDERS, &order("kept", "A1", 5.0, &ts(9)))
        .unwrap();
    store
        .insert_or_replace(ORDERS, &order("gone", "A2", 5.0, &ts(1)))
        .unwrap();
    let listener = listener(&store);

    let stale = change(ChangeKind::Removed, TENANT, &order("kept", "A1", 5.0, &ts(2)));
    assert_eq!(listener.apply(&stale).unwrap(), ChangeOutcome::Ignored);
    assert!(total(&store, "kept").is_some());

    let removed = change(ChangeKind::Removed, TENANT, &order("gone", "A2", 5.0, &ts(1)));
    assert_eq!(listener.apply(&removed).unwrap(), ChangeOutcome::Deleted);
    assert!(total(&store, "gone").is_none());

    let unclocked = change(ChangeKind::Removed, TENANT, &Record::new("kept"));
    assert_eq!(listener.apply(&unclocked).unwrap(), ChangeOutcome::Deleted);
}

#[tokio::test]
async fn spawned_listener_follows_the_remote() {
    let store = store();
    let remote = MemoryRemote::new();
    let events = remote.subscribe(TENANT, ORDERS).unwrap();
    let handle = listener(&store).spawn(events);

    let doc = naming::to_remote(order("o1", "A1", 4.5, &ts(1)).fields());
    remote.set_document(TENANT, ORDERS, "o1", &doc, true).await.unwrap();

    let mut applied = false;
    for _ in 0..100 {
        if total(&store, "o1") == Some(4.5) {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied);

    drop(remote);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
