//! Outbox integration tests: transactional staging and the publish cycle,
//! against both store backends.

#[path = "../support/mod.rs"]
mod support;

use std::sync::Arc;

use pipeline_relay::store::OutboxLog;
use pipeline_relay::{
    create_event, pipeline_registry, HashMapStore, InMemoryBroker, LinearBackoff,
    OutboxPublisher, SqliteStore, Store, UnitOfWork,
};
use serde_json::json;

use support::{outbox_row, stage, ScriptedTransport};

// ============================================================================
// Staging
// ============================================================================

fn rolled_back_rows_never_appear<S: Store>(store: S) {
    {
        let mut uow = store.begin().unwrap();
        create_event(&mut uow, "job.completed", json!({"job_id": "a"})).unwrap();
        create_event(&mut uow, "job.completed", json!({"job_id": "b"})).unwrap();
        // dropped without commit
    }
    assert!(store.begin().unwrap().unpublished_outbox(10).unwrap().is_empty());

    let mut uow = store.begin().unwrap();
    create_event(&mut uow, "job.completed", json!({"job_id": "c"})).unwrap();
    create_event(&mut uow, "job.completed", json!({"job_id": "d"})).unwrap();
    uow.commit().unwrap();

    let visible = store.begin().unwrap().unpublished_outbox(10).unwrap();
    let ids: Vec<_> = visible.iter().map(|e| e.payload["job_id"].clone()).collect();
    assert_eq!(ids, vec![json!("c"), json!("d")]);
}

#[test]
fn memory_store_rollback_discards_staged_rows() {
    rolled_back_rows_never_appear(HashMapStore::new());
}

#[test]
fn sqlite_store_rollback_discards_staged_rows() {
    rolled_back_rows_never_appear(SqliteStore::open_in_memory().unwrap());
}

// ============================================================================
// Publish cycle
// ============================================================================

fn partial_failure_marks_only_delivered_rows<S: Store + Clone>(store: S) {
    let broker = InMemoryBroker::new();
    let transport = ScriptedTransport::new(broker.clone());

    let rows: Vec<_> = (0..5)
        .map(|n| stage(&store, "job.completed", json!({"n": n, "fail": n % 2 == 0})))
        .collect();

    let publisher = OutboxPublisher::new(store.clone(), transport.clone(), Arc::new(pipeline_registry()))
        .with_retry_policy(LinearBackoff::immediate(0));
    let stats = publisher.publish_pending().unwrap();
    assert_eq!(stats.selected, 5);
    assert_eq!(stats.published, 2);
    assert_eq!(stats.failed, 3);
    assert_eq!(broker.published().unwrap().len(), 2);
    assert_eq!(transport.refused().len(), 3);

    let mut errors = Vec::new();
    for row in &rows {
        let current = outbox_row(&store, row.id);
        if row.payload["fail"] == json!(true) {
            assert!(!current.published);
            assert!(current.published_at.is_none());
            assert_eq!(current.retry_count, 1);
            errors.push(current.last_error.unwrap());
        } else {
            assert!(current.published);
            assert!(current.published_at.is_some());
            assert_eq!(current.retry_count, 0);
        }
    }
    errors.sort();
    errors.dedup();
    assert_eq!(errors.len(), 3, "each failure keeps its own error text");

    // failed rows come back next cycle and count up again
    let again = publisher.publish_pending().unwrap();
    assert_eq!(again.selected, 3);
    assert_eq!(again.failed, 3);
    assert_eq!(outbox_row(&store, rows[0].id).retry_count, 2);
}

#[test]
fn memory_store_partial_failure() {
    partial_failure_marks_only_delivered_rows(HashMapStore::new());
}

#[test]
fn sqlite_store_partial_failure() {
    partial_failure_marks_only_delivered_rows(SqliteStore::open_in_memory().unwrap());
}

#[test]
fn broker_outage_stalls_rows_until_it_returns() {
    let store = HashMapStore::new();
    let broker = InMemoryBroker::new();
    let event = stage(&store, "scene.saved", json!({"document_id": "d", "scene_number": 1}));

    let publisher = OutboxPublisher::new(store.clone(), broker.clone(), Arc::new(pipeline_registry()))
        .with_retry_policy(LinearBackoff::immediate(2))
        .with_alert_threshold(3);

    broker.set_offline(true).unwrap();
    for _ in 0..3 {
        assert_eq!(publisher.publish_pending().unwrap().failed, 1);
    }
    let stalled = publisher.stalled(3).unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, event.id);

    broker.set_offline(false).unwrap();
    assert_eq!(publisher.publish_pending().unwrap().published, 1);
    let sent = broker.published().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].exchange, "scene_saved_events");
    assert_eq!(sent[0].envelope.event_type, "scene.saved");
    assert_eq!(sent[0].envelope.payload["scene_number"], 1);
}

#[test]
fn sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let event = {
        let store = SqliteStore::open(&path).unwrap();
        stage(&store, "job.completed", json!({"job_id": "j"}))
    };

    let store = SqliteStore::open(&path).unwrap();
    let publisher = OutboxPublisher::new(store.clone(), InMemoryBroker::new(), Arc::new(pipeline_registry()));
    assert_eq!(publisher.publish_pending().unwrap().published, 1);
    assert!(outbox_row(&store, event.id).published);
}
