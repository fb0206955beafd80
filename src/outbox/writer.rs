use serde_json::Value;
use tracing::debug;

use crate::event::EventKind;
use crate::store::{NewOutboxEvent, OutboxEvent, OutboxLog, StoreResult};

/// Stage an outbox row inside the caller's unit of work.
///
/// Nothing is sent here. The row becomes durable, and visible to the
/// publisher, only when the caller commits.
pub fn create_event<U>(uow: &mut U, event_type: &str, payload: Value) -> StoreResult<OutboxEvent>
where
    U: OutboxLog + ?Sized,
{
    let event = uow.insert_outbox(NewOutboxEvent::new(event_type, payload))?;
    debug!(event_id = %event.id, event_type, "Outbox event staged");
    Ok(event)
}

/// [`create_event`] for a typed pipeline event.
pub fn create_kind<U>(uow: &mut U, kind: &EventKind) -> StoreResult<OutboxEvent>
where
    U: OutboxLog + ?Sized,
{
    create_event(uow, kind.event_type(), kind.payload()?)
}
