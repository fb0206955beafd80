//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pipeline_relay::store::{NewInboxEvent, ProcessingJob};
use pipeline_relay::transport::TransportResult;
use pipeline_relay::{
    create_event, InMemoryBroker, InboxEvent, OutboxEvent, Store, Subscription, Transport,
    TransportError, UnitOfWork,
};
use pipeline_relay::store::{InboxLog, JobLog, JobStatus, OutboxLog};
use serde_json::{json, Value};
use uuid::Uuid;

/// Stage and commit one outbox row.
pub fn stage<S: Store>(store: &S, event_type: &str, payload: Value) -> OutboxEvent {
    let mut uow = store.begin().unwrap();
    let event = create_event(&mut uow, event_type, payload).unwrap();
    uow.commit().unwrap();
    event
}

/// Land and commit one inbox row with a series key.
pub fn land_series<S: Store>(store: &S, correlation: &str, sequence: i64) -> Option<InboxEvent> {
    let event = NewInboxEvent::new("scene.saved", scene_payload(correlation, sequence))
        .with_idempotency_key(format!("scene.saved:{}:{}", correlation, sequence))
        .with_series(correlation, sequence);
    let mut uow = store.begin().unwrap();
    let landed = uow.insert_inbox(event, chrono::Utc::now()).unwrap();
    uow.commit().unwrap();
    landed
}

pub fn scene_payload(document_id: &str, scene_number: i64) -> Value {
    json!({
        "document_id": document_id,
        "scene_number": scene_number,
        "scene_text": format!("scene {}", scene_number),
    })
}

pub fn outbox_row<S: Store>(store: &S, id: Uuid) -> OutboxEvent {
    store.begin().unwrap().outbox_event(id).unwrap().unwrap()
}

pub fn inbox_row<S: Store>(store: &S, id: Uuid) -> InboxEvent {
    store.begin().unwrap().inbox_event(id).unwrap().unwrap()
}

/// Insert a job in `status` and return its id.
pub fn job<S: Store>(store: &S, status: JobStatus) -> Uuid {
    let job = ProcessingJob::new(Uuid::new_v4(), status);
    let mut uow = store.begin().unwrap();
    uow.insert_job(&job).unwrap();
    uow.commit().unwrap();
    job.id
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Broker wrapper refusing publishes whose payload carries `"fail": true`.
///
/// Each refusal names the payload's `n` field, so failures are
/// distinguishable by their error text.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: InMemoryBroker,
    refused: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedTransport {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            refused: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn refused(&self) -> Vec<Value> {
        self.refused.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn publish(
        &self,
        event_type: &str,
        payload: &Value,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        if payload["fail"] == json!(true) {
            self.refused.lock().unwrap().push(payload.clone());
            return Err(TransportError::Rejected(format!(
                "broker refused message {}",
                payload["n"]
            )));
        }
        self.inner.publish(event_type, payload, exchange, routing_key)
    }

    fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> TransportResult<Box<dyn Subscription>> {
        self.inner.subscribe(exchange, routing_key, queue)
    }
}
