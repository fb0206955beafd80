pub mod config;
pub mod event;
pub mod inbox;
pub mod outbox;
pub mod pipeline;
pub mod retry;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use config::{ConfigError, InboxConfig, OutboxConfig, RelayConfig};
pub use event::{
    pipeline_registry, Envelope, EventKind, EventKindError, EventRegistry, EventRoute,
    IdempotencyKey, SeriesKeySpec,
};
pub use inbox::{
    ConsumeStats, HandlerError, HandlerRegistry, InboxConsumer, InboxProcessor, LandOutcome,
    OrderingResolver, ProcessStats, SelectionMode,
};
pub use outbox::{create_event, create_kind, OutboxPublisher, PublishStats};
pub use pipeline::{approve_job, submit_scenes, ApprovalError, ApprovalOutcome};
pub use retry::{ExponentialBackoff, FixedDelay, LinearBackoff, RetryPolicy};
pub use service::{RelayHandle, RelayService, RelayStats, StartError};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use store::{
    transaction, HashMapStore, InboxEvent, InboxStatus, OutboxEvent, Store, StoreError,
    StoreResult, UnitOfWork,
};
pub use transport::{Delivery, InMemoryBroker, Subscription, Transport, TransportError};
pub use worker::{WorkerStats, WorkerThread};
