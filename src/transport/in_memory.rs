//! In-memory topic broker for testing and single-process scenarios.
//!
//! Models the parts of an AMQP broker the relay relies on:
//! - topic exchanges with pattern bindings to named, durable queues
//! - competing consumers on one queue
//! - manual acknowledgement; unacked messages return to the queue when
//!   rejected with requeue or when their subscription is dropped
//! - fault injection (`set_offline`) for exercising retry paths

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::topic::topic_matches;
use super::{Delivery, Subscription, Transport, TransportError, TransportResult};
use crate::event::Envelope;

/// A message as it was accepted by [`InMemoryBroker::publish`].
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

#[derive(Clone, Debug)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    rejected: Vec<Message>,
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    published: Vec<PublishedMessage>,
    next_tag: u64,
    offline: bool,
}

struct Shared {
    state: Mutex<BrokerState>,
    ready: Condvar,
}

/// Thread-safe in-memory broker. Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    strict: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker that declares exchanges on first publish, like a producer that
    /// declares its exchange before sending.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                ready: Condvar::new(),
            }),
            strict: false,
        }
    }

    /// Broker that refuses publishes to undeclared exchanges.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    fn lock(&self, op: &'static str) -> TransportResult<MutexGuard<'_, BrokerState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| TransportError::LockPoisoned(op))
    }

    pub fn declare_exchange(&self, exchange: &str) -> TransportResult<()> {
        self.lock("declare")?.exchanges.insert(exchange.to_string());
        Ok(())
    }

    /// Simulate the broker going away (`true`) or coming back (`false`).
    pub fn set_offline(&self, offline: bool) -> TransportResult<()> {
        self.lock("set_offline")?.offline = offline;
        Ok(())
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> TransportResult<Vec<PublishedMessage>> {
        Ok(self.lock("published")?.published.clone())
    }

    /// Messages waiting for a consumer on `queue`.
    pub fn ready_count(&self, queue: &str) -> TransportResult<usize> {
        Ok(self
            .lock("ready_count")?
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0))
    }

    /// Messages delivered on `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> TransportResult<usize> {
        Ok(self
            .lock("unacked_count")?
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0))
    }

    /// Bodies rejected without requeue on `queue`.
    pub fn rejected(&self, queue: &str) -> TransportResult<Vec<Vec<u8>>> {
        Ok(self
            .lock("rejected")?
            .queues
            .get(queue)
            .map(|q| q.rejected.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default())
    }

    /// Deliver a raw body straight to `exchange`, bypassing envelope encoding.
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> TransportResult<usize> {
        let mut state = self.lock("publish")?;
        self.route(&mut state, exchange, routing_key, body)
    }

    fn route(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> TransportResult<usize> {
        if state.offline {
            return Err(TransportError::Unreachable("broker offline".into()));
        }
        if !state.exchanges.contains(exchange) {
            if self.strict {
                return Err(TransportError::UnknownExchange(exchange.to_string()));
            }
            state.exchanges.insert(exchange.to_string());
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for queue in &targets {
            state
                .queues
                .entry(queue.clone())
                .or_default()
                .ready
                .push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                });
        }
        if !targets.is_empty() {
            self.shared.ready.notify_all();
        }
        Ok(targets.len())
    }
}

impl Transport for InMemoryBroker {
    fn publish(
        &self,
        event_type: &str,
        payload: &Value,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        let envelope = Envelope::new(event_type, payload.clone());
        let body = envelope.encode().map_err(TransportError::Encode)?;

        let mut state = self.lock("publish")?;
        self.route(&mut state, exchange, routing_key, body)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope,
        });
        Ok(())
    }

    fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> TransportResult<Box<dyn Subscription>> {
        let mut state = self.lock("subscribe")?;
        if state.offline {
            return Err(TransportError::Unreachable("broker offline".into()));
        }
        state.exchanges.insert(exchange.to_string());
        state.queues.entry(queue.to_string()).or_default();
        let already_bound = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.pattern == routing_key && b.queue == queue);
        if !already_bound {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
            owned: HashSet::new(),
        }))
    }
}

/// Consumer on one queue of an [`InMemoryBroker`].
///
/// Unsettled deliveries go back to the front of the queue when dropped.
pub struct InMemorySubscription {
    broker: InMemoryBroker,
    queue: String,
    owned: HashSet<u64>,
}

impl InMemorySubscription {
    fn settle(&mut self, tag: u64, requeue: Option<bool>) -> TransportResult<()> {
        if !self.owned.remove(&tag) {
            return Err(TransportError::Rejected(format!("unknown delivery tag {}", tag)));
        }
        self.release(tag, requeue)
    }

    fn release(&self, tag: u64, requeue: Option<bool>) -> TransportResult<()> {
        let mut state = self.broker.lock("settle")?;
        let queue = state.queues.entry(self.queue.clone()).or_default();
        let Some(mut message) = queue.unacked.remove(&tag) else {
            return Ok(());
        };
        match requeue {
            None => {}
            Some(true) => {
                message.redelivered = true;
                queue.ready.push_front(message);
                self.broker.shared.ready.notify_all();
            }
            Some(false) => queue.rejected.push(message),
        }
        Ok(())
    }
}

impl Subscription for InMemorySubscription {
    fn next(&mut self, timeout: Duration) -> TransportResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock("next")?;
        loop {
            if state.offline {
                return Err(TransportError::Unreachable("broker offline".into()));
            }
            let tag = state.next_tag + 1;
            let queue = state.queues.entry(self.queue.clone()).or_default();
            if let Some(message) = queue.ready.pop_front() {
                let delivery = Delivery {
                    tag,
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    redelivered: message.redelivered,
                };
                queue.unacked.insert(tag, message);
                state.next_tag = tag;
                self.owned.insert(tag);
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .broker
                .shared
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| TransportError::LockPoisoned("next"))?;
            state = guard;
        }
    }

    fn ack(&mut self, tag: u64) -> TransportResult<()> {
        self.settle(tag, None)
    }

    fn reject(&mut self, tag: u64, requeue: bool) -> TransportResult<()> {
        self.settle(tag, Some(requeue))
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let tags: Vec<u64> = self.owned.drain().collect();
        for tag in tags {
            let _ = self.release(tag, Some(true));
        }
    }
}
