use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use super::StartError;
use crate::config::RelayConfig;
use crate::event::EventRegistry;
use crate::inbox::{ConsumeStats, HandlerRegistry, InboxConsumer, InboxProcessor, ProcessStats};
use crate::outbox::{OutboxPublisher, PublishStats};
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::transport::{Subscription, Transport};
use crate::worker::{WorkerStats, WorkerThread};

/// A queue to consume, bound to an exchange with a routing key pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

#[derive(Clone, Debug)]
enum PendingSubscription {
    Explicit(SubscriptionSpec),
    Event { event_type: String, queue: String },
}

/// Rows deleted by the cleanup thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub outbox_deleted: usize,
    pub inbox_deleted: usize,
}

/// Totals across every relay thread, reported on stop.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RelayStats {
    pub published: WorkerStats<PublishStats>,
    pub processed: WorkerStats<ProcessStats>,
    pub consumed: WorkerStats<ConsumeStats>,
    pub cleaned: WorkerStats<CleanupStats>,
}

/// Builder for one service's relay threads.
pub struct RelayService<S, T> {
    name: String,
    store: S,
    transport: T,
    registry: Arc<EventRegistry>,
    handlers: Arc<HandlerRegistry>,
    config: RelayConfig,
    subscriptions: Vec<PendingSubscription>,
    consume_timeout: Duration,
    publish_retry: Option<Arc<dyn RetryPolicy>>,
    inbox_retry: Option<Arc<dyn RetryPolicy>>,
}

impl<S, T> RelayService<S, T>
where
    S: Store + Clone + 'static,
    T: Transport + Clone + 'static,
{
    pub fn new(store: S, transport: T, registry: Arc<EventRegistry>) -> Self {
        Self {
            name: "relay".to_string(),
            store,
            transport,
            registry,
            handlers: Arc::new(HandlerRegistry::new()),
            config: RelayConfig::default(),
            subscriptions: Vec::new(),
            consume_timeout: Duration::from_millis(250),
            publish_retry: None,
            inbox_retry: None,
        }
    }

    /// Prefix for worker thread names.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// How long a consumer waits for a delivery before checking for stop.
    pub fn with_consume_timeout(mut self, timeout: Duration) -> Self {
        self.consume_timeout = timeout;
        self
    }

    /// Retry policy around each transport publish.
    pub fn with_publish_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.publish_retry = Some(Arc::new(policy));
        self
    }

    /// Delay before a failed inbox row is retried.
    pub fn with_inbox_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.inbox_retry = Some(Arc::new(policy));
        self
    }

    /// Consume `queue`, bound to `exchange` with `routing_key`.
    pub fn subscribe(mut self, exchange: &str, routing_key: &str, queue: &str) -> Self {
        self.subscriptions
            .push(PendingSubscription::Explicit(SubscriptionSpec {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            }));
        self
    }

    /// Consume `queue`, bound to the registered route of `event_type`.
    pub fn subscribe_event(mut self, event_type: &str, queue: &str) -> Self {
        self.subscriptions.push(PendingSubscription::Event {
            event_type: event_type.to_string(),
            queue: queue.to_string(),
        });
        self
    }

    fn resolve_subscriptions(&self) -> Result<Vec<SubscriptionSpec>, StartError> {
        self.subscriptions
            .iter()
            .map(|pending| match pending {
                PendingSubscription::Explicit(spec) => Ok(spec.clone()),
                PendingSubscription::Event { event_type, queue } => {
                    let route = self
                        .registry
                        .route(event_type)
                        .ok_or_else(|| StartError::UnknownEventType(event_type.clone()))?;
                    Ok(SubscriptionSpec {
                        exchange: route.exchange.clone(),
                        routing_key: route.routing_key.clone(),
                        queue: queue.clone(),
                    })
                }
            })
            .collect()
    }

    fn publisher(&self) -> OutboxPublisher<S, T> {
        let publisher = OutboxPublisher::new(
            self.store.clone(),
            self.transport.clone(),
            self.registry.clone(),
        )
        .with_config(&self.config.outbox);
        match &self.publish_retry {
            Some(policy) => publisher.with_retry_policy(policy.clone()),
            None => publisher,
        }
    }

    fn processor(&self) -> InboxProcessor<S> {
        let processor = InboxProcessor::new(self.store.clone(), self.handlers.clone())
            .with_config(&self.config.inbox);
        match &self.inbox_retry {
            Some(policy) => processor.with_retry_policy(policy.clone()),
            None => processor,
        }
    }

    /// Spawn every relay thread.
    ///
    /// Subscriptions are resolved before anything starts; threads spawned
    /// before a later spawn failure are stopped again.
    pub fn start(self) -> Result<RelayHandle, StartError> {
        let specs = self.resolve_subscriptions()?;
        let mut handle = RelayHandle::default();

        match self.spawn_all(specs, &mut handle) {
            Ok(()) => {
                info!(
                    relay = %self.name,
                    consumers = handle.consumers.len(),
                    "Relay started"
                );
                Ok(handle)
            }
            Err(e) => {
                handle.stop();
                Err(e)
            }
        }
    }

    fn spawn_all(
        &self,
        specs: Vec<SubscriptionSpec>,
        handle: &mut RelayHandle,
    ) -> Result<(), StartError> {
        let publisher = self.publisher();
        handle.publisher = Some(self.spawn(
            "outbox-publisher",
            self.config.outbox.poll_interval,
            move |stats: &mut PublishStats| match publisher.publish_pending() {
                Ok(cycle) => stats.merge(PublishStats {
                    errors: Vec::new(),
                    ..cycle
                }),
                Err(e) => error!(error = %e, "Outbox cycle failed"),
            },
        )?);

        let processor = self.processor();
        handle.processor = Some(self.spawn(
            "inbox-processor",
            self.config.inbox.poll_interval,
            move |stats: &mut ProcessStats| match processor.process_pending() {
                Ok(cycle) => stats.merge(ProcessStats {
                    errors: Vec::new(),
                    ..cycle
                }),
                Err(e) => error!(error = %e, "Inbox cycle failed"),
            },
        )?);

        let outbox = self.publisher();
        let inbox = self.processor();
        let outbox_retention = self.config.outbox.retention;
        let inbox_retention = self.config.inbox.retention;
        handle.cleanup = Some(self.spawn(
            "cleanup",
            self.config.cleanup_interval,
            move |stats: &mut CleanupStats| {
                match outbox.cleanup(outbox_retention) {
                    Ok(deleted) => stats.outbox_deleted += deleted,
                    Err(e) => error!(error = %e, "Outbox cleanup failed"),
                }
                match inbox.cleanup(inbox_retention) {
                    Ok(deleted) => stats.inbox_deleted += deleted,
                    Err(e) => error!(error = %e, "Inbox cleanup failed"),
                }
            },
        )?);

        for spec in specs {
            let worker = format!("consumer-{}", spec.queue);
            let mut consumer = ConsumerLoop {
                consumer: InboxConsumer::new(self.store.clone(), self.registry.clone()),
                transport: self.transport.clone(),
                spec,
                subscription: None,
                timeout: self.consume_timeout,
            };
            handle.consumers.push(self.spawn(
                &worker,
                Duration::ZERO,
                move |stats: &mut ConsumeStats| consumer.tick(stats),
            )?);
        }
        Ok(())
    }

    fn spawn<U, F>(&self, worker: &str, interval: Duration, tick: F) -> Result<WorkerThread<U>, StartError>
    where
        U: Default + Send + 'static,
        F: FnMut(&mut U) + Send + 'static,
    {
        let name = format!("{}-{}", self.name, worker);
        WorkerThread::spawn(&name, interval, U::default(), tick).map_err(|source| StartError::Spawn {
            worker: name,
            source,
        })
    }
}

/// One queue's consume loop. Reconnects after transport errors.
struct ConsumerLoop<S, T> {
    consumer: InboxConsumer<S>,
    transport: T,
    spec: SubscriptionSpec,
    subscription: Option<Box<dyn Subscription>>,
    timeout: Duration,
}

impl<S: Store, T: Transport> ConsumerLoop<S, T> {
    fn tick(&mut self, stats: &mut ConsumeStats) {
        if self.subscription.is_none() {
            match self.transport.subscribe(
                &self.spec.exchange,
                &self.spec.routing_key,
                &self.spec.queue,
            ) {
                Ok(subscription) => {
                    info!(queue = %self.spec.queue, exchange = %self.spec.exchange, "Subscribed");
                    self.subscription = Some(subscription);
                }
                Err(e) => {
                    warn!(queue = %self.spec.queue, error = %e, "Subscribe failed; retrying");
                    thread::sleep(self.timeout);
                    return;
                }
            }
        }

        let Some(subscription) = self.subscription.as_mut() else {
            return;
        };
        match self.consumer.run_once(subscription.as_mut(), self.timeout) {
            Ok(Some(delivered)) => stats.merge(delivered),
            Ok(None) => {}
            Err(e) => {
                if e.is_transient() {
                    warn!(queue = %self.spec.queue, error = %e, "Consumer lost its connection; resubscribing");
                } else {
                    error!(queue = %self.spec.queue, error = %e, "Consumer failed; resubscribing");
                }
                self.subscription = None;
                thread::sleep(self.timeout);
            }
        }
    }
}

/// Running relay threads.
#[derive(Default)]
pub struct RelayHandle {
    publisher: Option<WorkerThread<PublishStats>>,
    processor: Option<WorkerThread<ProcessStats>>,
    cleanup: Option<WorkerThread<CleanupStats>>,
    consumers: Vec<WorkerThread<ConsumeStats>>,
}

impl RelayHandle {
    /// Number of consumer threads.
    pub fn consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Stop every thread and collect their totals.
    ///
    /// Consumers stop first so nothing lands after the last processor cycle.
    pub fn stop(self) -> RelayStats {
        let mut stats = RelayStats::default();

        for consumer in &self.consumers {
            consumer.signal_stop();
        }
        for consumer in self.consumers {
            let done = consumer.stop();
            stats.consumed.polls += done.polls;
            stats.consumed.stats.merge(done.stats);
        }
        if let Some(processor) = self.processor {
            stats.processed = processor.stop();
        }
        if let Some(publisher) = self.publisher {
            stats.published = publisher.stop();
        }
        if let Some(cleanup) = self.cleanup {
            stats.cleaned = cleanup.stop();
        }

        info!(
            published = stats.published.stats.published,
            processed = stats.processed.stats.succeeded,
            landed = stats.consumed.stats.landed,
            "Relay stopped"
        );
        stats
    }
}
