//! End-to-end relay tests: two services with their own stores talking
//! through a shared broker.

#[path = "../support/mod.rs"]
mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeline_relay::event::kinds::{PROMPT_EXTRACTED, SCENE_SAVED};
use pipeline_relay::event::{PromptExtracted, SceneSaved};
use pipeline_relay::store::JobStatus;
use pipeline_relay::{
    approve_job, create_kind, pipeline_registry, submit_scenes, transaction, Envelope, EventKind,
    FixedDelay, HandlerError, HandlerRegistry, HashMapStore, InMemoryBroker, InboxConfig,
    LinearBackoff, OutboxConfig, RelayConfig, RelayService, SqliteStore, StartError,
    Subscription, Transport,
};

use support::{job, scene_payload, wait_until};

/// Declare and bind `queue` up front so nothing published before the relay's
/// consumer subscribes is dropped.
fn bind(broker: &InMemoryBroker, exchange: &str, routing_key: &str, queue: &str) {
    drop(broker.subscribe(exchange, routing_key, queue).unwrap());
}

fn fast_config() -> RelayConfig {
    RelayConfig::default()
        .with_outbox(OutboxConfig::default().with_poll_interval(Duration::from_millis(10)))
        .with_inbox(
            InboxConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_max_retries(3),
        )
}

#[test]
fn approved_scenes_flow_to_prompt_extraction_in_order() {
    let broker = InMemoryBroker::new();
    let registry = Arc::new(pipeline_registry());

    // image generation listens for prompts; bind before anything is sent
    let mut prompts = broker
        .subscribe("prompt_extracted_events", PROMPT_EXTRACTED, "image_generation.prompts")
        .unwrap();
    bind(&broker, "scene_saved_events", SCENE_SAVED, "prompt_extraction.scene_saved");

    let splitter_store = HashMapStore::new();
    let splitter = RelayService::new(splitter_store.clone(), broker.clone(), registry.clone())
        .with_name("splitter")
        .with_config(fast_config())
        .with_publish_retry(LinearBackoff::immediate(0))
        .start()
        .unwrap();

    let extractor_store = SqliteStore::open_in_memory().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let store = extractor_store.clone();
        let seen = seen.clone();
        HandlerRegistry::new().on_payload(SCENE_SAVED, move |scene: SceneSaved, _| {
            seen.lock().unwrap().push(scene.scene_number);
            let prompt = EventKind::PromptExtracted(PromptExtracted {
                story_uuid: scene.document_id.to_string(),
                scene_number: scene.scene_number,
                prompt: format!("illustrate: {}", scene.scene_text),
                scene_id: scene.scene_id.to_string(),
                previous_contexts: Vec::new(),
            });
            transaction(&store, |uow| -> Result<(), HandlerError> {
                create_kind(uow, &prompt)?;
                Ok(())
            })
        })
    };
    let extractor = RelayService::new(extractor_store.clone(), broker.clone(), registry)
        .with_name("extractor")
        .with_config(fast_config())
        .with_handlers(handlers)
        .with_consume_timeout(Duration::from_millis(20))
        .with_publish_retry(LinearBackoff::immediate(0))
        .subscribe_event(SCENE_SAVED, "prompt_extraction.scene_saved")
        .start()
        .unwrap();
    assert_eq!(extractor.consumers(), 1);

    let id = job(&splitter_store, JobStatus::Splitting);
    submit_scenes(&splitter_store, id, ["one", "two", "three"]).unwrap();
    approve_job(&splitter_store, id).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        broker.ready_count("image_generation.prompts").unwrap_or(0) == 3
    }));

    let extractor_stats = extractor.stop();
    let splitter_stats = splitter.stop();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(splitter_stats.published.stats.published, 5);
    assert_eq!(extractor_stats.consumed.stats.landed, 3);
    assert_eq!(extractor_stats.processed.stats.succeeded, 3);
    assert_eq!(extractor_stats.published.stats.published, 3);

    let mut numbers = Vec::new();
    while let Some(delivery) = prompts.next(Duration::from_millis(10)).unwrap() {
        let envelope = Envelope::decode(&delivery.body).unwrap();
        assert_eq!(envelope.event_type, PROMPT_EXTRACTED);
        numbers.push(envelope.payload["scene_number"].as_i64().unwrap());
        prompts.ack(delivery.tag).unwrap();
    }
    numbers.sort();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn failing_handler_rows_end_up_dead_lettered() {
    let broker = InMemoryBroker::new();
    let store = HashMapStore::new();
    bind(&broker, "scene_saved_events", "scene.#", "prompts");
    let handlers = HandlerRegistry::new().on(SCENE_SAVED, |_| {
        Err(HandlerError::Rejected("no prompt model configured".into()))
    });
    let relay = RelayService::new(store.clone(), broker.clone(), Arc::new(pipeline_registry()))
        .with_config(fast_config())
        .with_handlers(handlers)
        .with_inbox_retry(FixedDelay::new(Duration::ZERO))
        .with_consume_timeout(Duration::from_millis(20))
        .subscribe("scene_saved_events", "scene.#", "prompts")
        .start()
        .unwrap();

    broker
        .publish(SCENE_SAVED, &scene_payload("doc", 1), "scene_saved_events", SCENE_SAVED)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        store
            .inbox_rows()
            .map(|rows| rows.iter().any(|r| r.is_dead_letter()))
            .unwrap_or(false)
    }));
    let stats = relay.stop();
    assert_eq!(stats.processed.stats.dead_lettered, 1);
    assert_eq!(stats.processed.stats.failed, 2);
}

#[test]
fn consumer_recovers_after_broker_outage() {
    let broker = InMemoryBroker::new();
    let store = HashMapStore::new();
    bind(&broker, "scene_saved_events", SCENE_SAVED, "prompts");
    let relay = RelayService::new(store.clone(), broker.clone(), Arc::new(pipeline_registry()))
        .with_config(fast_config())
        .with_consume_timeout(Duration::from_millis(20))
        .subscribe_event(SCENE_SAVED, "prompts")
        .start()
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    broker.set_offline(true).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    broker.set_offline(false).unwrap();

    broker
        .publish(SCENE_SAVED, &scene_payload("doc", 1), "scene_saved_events", SCENE_SAVED)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        store.inbox_rows().map(|rows| rows.len() == 1).unwrap_or(false)
    }));
    assert_eq!(relay.stop().consumed.stats.landed, 1);
}

#[test]
fn unknown_subscription_refuses_to_start() {
    let result = RelayService::new(
        HashMapStore::new(),
        InMemoryBroker::new(),
        Arc::new(pipeline_registry()),
    )
    .subscribe_event("order.placed", "orders")
    .start();
    assert!(matches!(result, Err(StartError::UnknownEventType(t)) if t == "order.placed"));
}
