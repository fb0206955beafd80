//! Inbound side: land broker deliveries, then process them.
//!
//! ```text
//! broker ──▶ InboxConsumer::land ──▶ inbox row (pending)
//!                                        │
//!                 InboxProcessor::claim ◀┘  lease + ordering
//!                        │
//!                        ▼
//!              HandlerRegistry::handle
//!               ok │          │ err
//!                  ▼          ▼
//!             processed   retry later / dead letter
//! ```
//!
//! Landing and processing are decoupled: a slow handler never holds up
//! acknowledgement, and a crash between the two loses nothing.

mod consumer;
mod handler;
mod processor;
mod resolver;

pub use consumer::{ConsumeStats, InboxConsumer, LandOutcome};
pub use handler::{HandlerError, HandlerRegistry};
pub use processor::{InboxProcessor, ProcessStats};
pub use resolver::{OrderingResolver, Resolution, SelectionMode};
