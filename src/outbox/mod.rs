//! Outbox - durable record of events to publish.
//!
//! Two phases:
//! 1. **Write** (`create_event`) - stage a row inside the business unit of
//!    work; it commits or rolls back with the state change it announces.
//! 2. **Publish** (`OutboxPublisher`) - periodically drain unpublished rows
//!    to the broker and mark exactly the delivered ones published.
//!
//! ```text
//! business tx ──create_event──▶ outbox_events ──publish_pending──▶ broker
//!                                    ▲                  │
//!                                    └─ retry_count++ ◀─┘ (on failure)
//! ```

mod publisher;
mod writer;

pub use publisher::{OutboxPublisher, PublishStats};
pub use writer::{create_event, create_kind};
