//! Broker abstraction.
//!
//! The relay only needs two things from a broker: publish a persistent
//! message to a topic exchange, and consume a queue bound to an exchange
//! with manual acknowledgement.
//!
//! ```text
//!  OutboxPublisher ──publish(type, payload, exchange, key)──▶ ┌──────────┐
//!                                                             │  broker  │
//!  InboxConsumer ◀──Subscription::next / ack / reject──────── └──────────┘
//! ```
//!
//! Subscriptions are pull-based: the consumer asks for the next delivery,
//! lands it, then settles it before asking again.

mod error;
mod in_memory;
mod topic;

use std::time::Duration;

use serde_json::Value;

pub use error::{TransportError, TransportResult};
pub use in_memory::{InMemoryBroker, InMemorySubscription, PublishedMessage};
pub use topic::topic_matches;

/// One message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Identifies the delivery for `ack`/`reject` on the same subscription.
    pub tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Set when the broker delivered this message before.
    pub redelivered: bool,
}

/// Publishing and subscribing side of a broker connection.
pub trait Transport: Send + Sync {
    /// Wrap `payload` in an envelope and publish it persistently.
    fn publish(
        &self,
        event_type: &str,
        payload: &Value,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()>;

    /// Declare `exchange` and `queue`, bind them with the `routing_key`
    /// pattern, and start consuming `queue`.
    fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> TransportResult<Box<dyn Subscription>>;
}

/// A consumer on one queue.
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next delivery.
    fn next(&mut self, timeout: Duration) -> TransportResult<Option<Delivery>>;

    /// The delivery was handled; drop it from the queue.
    fn ack(&mut self, tag: u64) -> TransportResult<()>;

    /// Refuse the delivery, either returning it to the queue or discarding it.
    fn reject(&mut self, tag: u64, requeue: bool) -> TransportResult<()>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn publish(
        &self,
        event_type: &str,
        payload: &Value,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        (**self).publish(event_type, payload, exchange, routing_key)
    }

    fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> TransportResult<Box<dyn Subscription>> {
        (**self).subscribe(exchange, routing_key, queue)
    }
}
