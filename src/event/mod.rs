//! Event model shared by the outbox and inbox sides.
//!
//! - [`Envelope`]: the JSON body carried by the broker.
//! - [`EventRegistry`]: event type → exchange/routing key, plus which payload
//!   fields identify a series.
//! - [`IdempotencyKey`]: dedupe and ordering keys derived from a payload.
//! - [`EventKind`]: the typed catalogue of pipeline events.

mod envelope;
mod idempotency;
pub mod kinds;
mod registry;

pub use envelope::Envelope;
pub use idempotency::IdempotencyKey;
pub use kinds::{
    pipeline_registry, EventKind, EventKindError, JobCompleted, PreviousContext,
    PromptExtracted, SceneSaved, ScenesBatchSaved,
};
pub use registry::{EventRegistry, EventRegistryBuilder, EventRoute, SeriesKeySpec};
