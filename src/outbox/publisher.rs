use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::event::EventRegistry;
use crate::retry::{retry_with, LinearBackoff, RetryPolicy};
use crate::store::{retention_cutoff, OutboxEvent, OutboxLog, Store, StoreResult, UnitOfWork};
use crate::transport::{Transport, TransportError};

/// Outcome of one publish cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishStats {
    pub selected: usize,
    pub published: usize,
    pub failed: usize,
    /// `(event id, error)` for every failed row.
    pub errors: Vec<(Uuid, String)>,
}

impl PublishStats {
    pub fn merge(&mut self, other: PublishStats) {
        self.selected += other.selected;
        self.published += other.published;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Drains unpublished outbox rows to the broker.
///
/// Each cycle reads a batch, publishes rows one by one (each wrapped in a
/// bounded transport retry), then records the outcome in a single unit of
/// work: successful rows are marked published together, failed rows get
/// `retry_count + 1` and their error. A failed row never blocks the rest of
/// its batch and is picked up again next cycle.
///
/// Rows are not leased. Two publishers over the same table may send a row
/// twice; consumers absorb that through their idempotency keys.
pub struct OutboxPublisher<S, T> {
    store: S,
    transport: T,
    registry: Arc<EventRegistry>,
    batch_size: usize,
    alert_threshold: u32,
    retry: Arc<dyn RetryPolicy>,
}

impl<S, T> OutboxPublisher<S, T> {
    pub fn new(store: S, transport: T, registry: Arc<EventRegistry>) -> Self {
        Self {
            store,
            transport,
            registry,
            batch_size: 100,
            alert_threshold: 3,
            retry: Arc::new(LinearBackoff::default()),
        }
    }

    /// Apply batch size and alert threshold from configuration.
    pub fn with_config(self, config: &OutboxConfig) -> Self {
        self.with_batch_size(config.batch_size)
            .with_alert_threshold(config.alert_threshold)
    }

    /// Set the maximum number of rows read per cycle.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the `retry_count` at which a row is reported as stalled.
    pub fn with_alert_threshold(mut self, threshold: u32) -> Self {
        self.alert_threshold = threshold;
        self
    }

    /// Set the retry policy wrapped around each transport publish.
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<S: Store, T: Transport> OutboxPublisher<S, T> {
    /// Run one publish cycle.
    pub fn publish_pending(&self) -> StoreResult<PublishStats> {
        // read-only; dropping the unit of work releases it
        let batch = self.store.begin()?.unpublished_outbox(self.batch_size)?;

        let mut stats = PublishStats {
            selected: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut succeeded = Vec::with_capacity(batch.len());
        let mut failures: Vec<(&OutboxEvent, String)> = Vec::new();
        for event in &batch {
            match self.publish_one(event) {
                Ok(()) => {
                    debug!(event_id = %event.id, event_type = %event.event_type, "Outbox event published");
                    succeeded.push(event.id);
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = event.retry_count + 1,
                        error = %e,
                        "Outbox publish failed"
                    );
                    failures.push((event, e.to_string()));
                }
            }
        }

        let mut uow = self.store.begin()?;
        stats.published = uow.mark_outbox_published(&succeeded, Utc::now())?;
        for (event, error) in failures {
            uow.record_outbox_failure(event.id, &error)?;
            if event.retry_count + 1 == self.alert_threshold {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    threshold = self.alert_threshold,
                    "Outbox event reached alert threshold"
                );
            }
            stats.failed += 1;
            stats.errors.push((event.id, error));
        }
        uow.commit()?;

        info!(
            selected = stats.selected,
            published = stats.published,
            failed = stats.failed,
            "Outbox cycle complete"
        );
        Ok(stats)
    }

    fn publish_one(&self, event: &OutboxEvent) -> Result<(), TransportError> {
        let route = self.registry.route(&event.event_type).ok_or_else(|| {
            TransportError::Rejected(format!("no route for event type {}", event.event_type))
        })?;
        retry_with(self.retry.as_ref(), TransportError::is_transient, |_| {
            self.transport.publish(
                &event.event_type,
                &event.payload,
                &route.exchange,
                &route.routing_key,
            )
        })
    }

    /// Unpublished rows at or above `threshold` failed attempts.
    pub fn stalled(&self, threshold: u32) -> StoreResult<Vec<OutboxEvent>> {
        self.store.begin()?.outbox_over_threshold(threshold)
    }

    /// Delete rows published longer than `retention` ago.
    pub fn cleanup(&self, retention: Duration) -> StoreResult<usize> {
        let cutoff = retention_cutoff(Utc::now(), retention);
        let mut uow = self.store.begin()?;
        let deleted = uow.purge_published_outbox(cutoff)?;
        uow.commit()?;
        if deleted > 0 {
            info!(deleted, "Outbox cleanup");
        }
        Ok(deleted)
    }
}
