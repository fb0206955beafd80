//! Inbox integration tests: idempotent landing, ordered processing,
//! retry budget and concurrent workers.

#[path = "../support/mod.rs"]
mod support;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pipeline_relay::{
    pipeline_registry, Envelope, FixedDelay, HandlerError, HandlerRegistry, HashMapStore,
    InMemoryBroker, InboxConsumer, InboxProcessor, InboxStatus, LandOutcome, SqliteStore, Store,
    Transport,
};
use uuid::Uuid;

use support::{inbox_row, land_series, scene_payload};

fn recording_handlers() -> (HandlerRegistry, Arc<Mutex<Vec<(String, i64)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handlers = HandlerRegistry::new().on("scene.saved", move |event| {
        let (correlation, sequence) = event.series().unwrap_or(("", 0));
        sink.lock().unwrap().push((correlation.to_string(), sequence));
        Ok(())
    });
    (handlers, seen)
}

// ============================================================================
// Landing
// ============================================================================

fn duplicate_delivery_is_absorbed<S: Store + Clone>(store: S) {
    let consumer = InboxConsumer::new(store.clone(), Arc::new(pipeline_registry()));
    let body = Envelope::new("scene.saved", scene_payload("doc-1", 4)).encode().unwrap();

    let LandOutcome::Landed(first) = consumer.land(&body).unwrap() else {
        panic!("first delivery should land");
    };
    assert_eq!(first.idempotency_key.as_deref(), Some("scene.saved:doc-1:4"));

    let second = consumer.land(&body).unwrap();
    assert_eq!(
        second,
        LandOutcome::Duplicate {
            key: "scene.saved:doc-1:4".into()
        }
    );

    let row = inbox_row(&store, first.id);
    assert_eq!(row.status, InboxStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.series(), Some(("doc-1", 4)));
    assert!(land_series(&store, "doc-1", 4).is_none());
}

#[test]
fn memory_store_absorbs_duplicates() {
    duplicate_delivery_is_absorbed(HashMapStore::new());
}

#[test]
fn sqlite_store_absorbs_duplicates() {
    duplicate_delivery_is_absorbed(SqliteStore::open_in_memory().unwrap());
}

#[test]
fn redelivered_message_lands_once() {
    let store = HashMapStore::new();
    let broker = InMemoryBroker::new();
    let mut subscription = broker
        .subscribe("scene_saved_events", "scene.*", "prompts.scene_saved")
        .unwrap();
    let consumer = InboxConsumer::new(store.clone(), Arc::new(pipeline_registry()));

    for _ in 0..2 {
        broker
            .publish(
                "scene.saved",
                &scene_payload("doc-1", 1),
                "scene_saved_events",
                "scene.saved",
            )
            .unwrap();
    }

    let mut stats = pipeline_relay::ConsumeStats::default();
    while let Some(step) = consumer
        .run_once(subscription.as_mut(), Duration::from_millis(50))
        .unwrap()
    {
        stats.merge(step);
    }
    assert_eq!(stats.landed, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(store.inbox_rows().unwrap().len(), 1);
    assert_eq!(broker.unacked_count("prompts.scene_saved").unwrap(), 0);
}

// ============================================================================
// Ordering
// ============================================================================

fn series_runs_one_step_per_cycle<S: Store + Clone>(store: S) {
    for n in [3, 1, 2] {
        land_series(&store, "S", n).unwrap();
    }
    let (handlers, seen) = recording_handlers();
    let processor = InboxProcessor::new(store, Arc::new(handlers));

    let expected = [("S".to_string(), 1), ("S".to_string(), 2), ("S".to_string(), 3)];
    for step in 1..=3 {
        let stats = processor.process_pending().unwrap();
        assert_eq!(stats.selected, 1, "cycle {} should run one row", step);
        assert_eq!(stats.deferred, 3 - step);
        assert_eq!(*seen.lock().unwrap(), expected[..step].to_vec());
    }
    assert_eq!(processor.process_pending().unwrap().selected, 0);
}

#[test]
fn memory_store_orders_series() {
    series_runs_one_step_per_cycle(HashMapStore::new());
}

#[test]
fn sqlite_store_orders_series() {
    series_runs_one_step_per_cycle(SqliteStore::open_in_memory().unwrap());
}

#[test]
fn independent_series_interleave() {
    let store = HashMapStore::new();
    for (c, n) in [("A", 2), ("B", 1), ("A", 1), ("B", 2)] {
        land_series(&store, c, n).unwrap();
    }
    let (handlers, seen) = recording_handlers();
    let processor = InboxProcessor::new(store, Arc::new(handlers));

    assert_eq!(processor.process_pending().unwrap().succeeded, 2);
    assert_eq!(processor.process_pending().unwrap().succeeded, 2);

    let seen = seen.lock().unwrap();
    let position = |c: &str, n: i64| seen.iter().position(|s| s.0 == c && s.1 == n).unwrap();
    assert!(position("A", 1) < position("A", 2));
    assert!(position("B", 1) < position("B", 2));
}

// ============================================================================
// Retry budget
// ============================================================================

fn always_failing_row_is_dead_lettered<S: Store + Clone>(store: S) {
    let row = land_series(&store, "S", 1).unwrap();
    let attempts = Arc::new(Mutex::new(0u32));
    let counter = attempts.clone();
    let handlers = HandlerRegistry::new().on("scene.saved", move |_| {
        *counter.lock().unwrap() += 1;
        Err(HandlerError::Failed("downstream unavailable".into()))
    });
    let max_retries = 4;
    let processor = InboxProcessor::new(store.clone(), Arc::new(handlers))
        .with_max_retries(max_retries)
        .with_retry_policy(FixedDelay::new(Duration::ZERO));

    for _ in 0..max_retries - 1 {
        assert_eq!(processor.process_pending().unwrap().failed, 1);
        let current = inbox_row(&store, row.id);
        assert_eq!(current.status, InboxStatus::Pending);
        assert_eq!(
            current.last_error.as_deref(),
            Some("handler failed: downstream unavailable")
        );
    }
    assert_eq!(processor.process_pending().unwrap().dead_lettered, 1);

    let parked = inbox_row(&store, row.id);
    assert_eq!(parked.status, InboxStatus::DeadLetter);
    assert!(parked
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("FAILED after 3 retries"));

    for _ in 0..3 {
        assert_eq!(processor.process_pending().unwrap().selected, 0);
    }
    assert_eq!(*attempts.lock().unwrap(), max_retries);
    assert_eq!(processor.dead_letters(10).unwrap().len(), 1);
}

#[test]
fn memory_store_dead_letters_after_budget() {
    always_failing_row_is_dead_lettered(HashMapStore::new());
}

#[test]
fn sqlite_store_dead_letters_after_budget() {
    always_failing_row_is_dead_lettered(SqliteStore::open_in_memory().unwrap());
}

#[test]
fn unknown_event_type_spends_the_budget() {
    let store = HashMapStore::new();
    let row = land_series(&store, "S", 1).unwrap();
    let processor = InboxProcessor::new(store.clone(), Arc::new(HandlerRegistry::new()))
        .with_max_retries(1);

    let stats = processor.process_pending().unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert!(stats.errors[0].1.contains("unknown event type"));
    assert!(inbox_row(&store, row.id).is_dead_letter());
}

// ============================================================================
// Concurrent workers
// ============================================================================

#[test]
fn concurrent_processors_never_share_a_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.db");
    let seed = SqliteStore::open(&path).unwrap();
    let total = 40;
    for n in 0..total {
        land_series(&seed, &format!("series-{}", n), 1).unwrap();
    }

    let handled = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let workers: Vec<_> = (0..3)
        .map(|_| {
            let store = SqliteStore::open(&path).unwrap();
            let sink = handled.clone();
            let handlers = HandlerRegistry::new().on("scene.saved", move |event| {
                sink.lock().unwrap().push(event.id);
                thread::sleep(Duration::from_millis(1));
                Ok(())
            });
            thread::spawn(move || {
                let processor = InboxProcessor::new(store, Arc::new(handlers)).with_batch_size(4);
                let mut idle = 0;
                while idle < 3 {
                    if processor.process_pending().unwrap().selected == 0 {
                        idle += 1;
                        thread::sleep(Duration::from_millis(5));
                    } else {
                        idle = 0;
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let handled = handled.lock().unwrap();
    let unique: HashSet<_> = handled.iter().collect();
    assert_eq!(handled.len(), total);
    assert_eq!(unique.len(), total);
}

#[test]
fn expired_lease_is_reclaimed() {
    let store = HashMapStore::new();
    let row = land_series(&store, "S", 1).unwrap();
    let (handlers, seen) = recording_handlers();
    let handlers = Arc::new(handlers);

    // a worker that claims and then dies
    let crashed = InboxProcessor::new(store.clone(), handlers.clone())
        .with_lease(Duration::from_millis(20));
    let (claimed, _) = crashed.claim().unwrap();
    assert_eq!(claimed[0].id, row.id);

    let survivor = InboxProcessor::new(store.clone(), handlers);
    assert_eq!(survivor.process_pending().unwrap().selected, 0);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(survivor.process_pending().unwrap().succeeded, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(inbox_row(&store, row.id).is_processed());
}
