use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::event::{Envelope, EventRegistry};
use crate::store::{InboxEvent, InboxLog, NewInboxEvent, Store, StoreResult, UnitOfWork};
use crate::transport::{Delivery, Subscription, TransportResult};

/// Result of landing one broker message.
#[derive(Clone, Debug, PartialEq)]
pub enum LandOutcome {
    /// New inbox row written.
    Landed(InboxEvent),
    /// A row with this idempotency key already exists.
    Duplicate { key: String },
    /// The body is not a valid envelope.
    Malformed(String),
}

/// Counters for one or more consumed deliveries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeStats {
    pub landed: usize,
    pub duplicates: usize,
    /// Returned to the queue after a store failure.
    pub requeued: usize,
    /// Discarded as malformed.
    pub rejected: usize,
}

impl ConsumeStats {
    pub fn merge(&mut self, other: ConsumeStats) {
        self.landed += other.landed;
        self.duplicates += other.duplicates;
        self.requeued += other.requeued;
        self.rejected += other.rejected;
    }

    pub fn total(&self) -> usize {
        self.landed + self.duplicates + self.requeued + self.rejected
    }
}

/// Lands broker deliveries into the inbox table.
///
/// Landing never runs handlers. A delivery is acknowledged only after its
/// row (or the duplicate it matched) is durable, so a crash between the
/// insert and the ack causes a redelivery that the idempotency key absorbs.
pub struct InboxConsumer<S> {
    store: S,
    registry: Arc<EventRegistry>,
}

impl<S: Store> InboxConsumer<S> {
    pub fn new(store: S, registry: Arc<EventRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decode `body` and insert it as a pending inbox row.
    pub fn land(&self, body: &[u8]) -> StoreResult<LandOutcome> {
        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => return Ok(LandOutcome::Malformed(e.to_string())),
        };

        let keys = self
            .registry
            .derive_keys(&envelope.event_type, &envelope.payload);
        let mut event = NewInboxEvent::new(&envelope.event_type, envelope.payload)
            .with_received_at(envelope.timestamp);
        if let Some(key) = &keys.key {
            event = event.with_idempotency_key(key.clone());
        }
        if let (Some(correlation_id), Some(sequence)) = (keys.correlation_id, keys.sequence_number) {
            event = event.with_series(correlation_id, sequence);
        }

        let mut uow = self.store.begin()?;
        let landed = uow.insert_inbox(event, Utc::now())?;
        uow.commit()?;

        Ok(match landed {
            Some(row) => {
                debug!(
                    event_id = %row.id,
                    event_type = %row.event_type,
                    idempotency_key = ?row.idempotency_key,
                    "Inbox event landed"
                );
                LandOutcome::Landed(row)
            }
            None => {
                let key = keys.key.unwrap_or_default();
                debug!(idempotency_key = %key, "Duplicate delivery skipped");
                LandOutcome::Duplicate { key }
            }
        })
    }

    /// Land one delivery and settle it on `subscription`.
    ///
    /// Landed and duplicate deliveries are acked. Malformed deliveries are
    /// rejected without requeue. Store failures requeue the delivery.
    pub fn handle_delivery(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
    ) -> TransportResult<ConsumeStats> {
        let mut stats = ConsumeStats::default();
        match self.land(&delivery.body) {
            Ok(LandOutcome::Landed(_)) => {
                subscription.ack(delivery.tag)?;
                stats.landed += 1;
            }
            Ok(LandOutcome::Duplicate { .. }) => {
                subscription.ack(delivery.tag)?;
                stats.duplicates += 1;
            }
            Ok(LandOutcome::Malformed(reason)) => {
                error!(
                    routing_key = %delivery.routing_key,
                    error = %reason,
                    "Discarding malformed message"
                );
                subscription.reject(delivery.tag, false)?;
                stats.rejected += 1;
            }
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Inbox insert failed; requeueing"
                );
                subscription.reject(delivery.tag, true)?;
                stats.requeued += 1;
            }
        }
        Ok(stats)
    }

    /// Wait up to `timeout` for one delivery and handle it.
    ///
    /// Returns `Ok(None)` when nothing arrived.
    pub fn run_once(
        &self,
        subscription: &mut dyn Subscription,
        timeout: Duration,
    ) -> TransportResult<Option<ConsumeStats>> {
        match subscription.next(timeout)? {
            Some(delivery) => self.handle_delivery(subscription, delivery).map(Some),
            None => Ok(None),
        }
    }
}
