//! Event handlers keyed by event type.
//!
//! ```ignore
//! let handlers = HandlerRegistry::new()
//!     .on_payload(SCENE_SAVED, |scene: SceneSaved, _event| {
//!         extract_prompt(&scene).map_err(|e| HandlerError::Failed(e.to_string()))
//!     })
//!     .on("job.completed", |event| Ok(()));
//! ```

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::event::EventKindError;
use crate::store::{InboxEvent, StoreError};

/// Failure of a single handler invocation. Every variant counts against the
/// row's retry budget.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// No handler registered for this event type
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Payload did not match the handler's expected shape
    #[error("decode failed: {0}")]
    Decode(String),

    /// Business logic refused the event
    #[error("rejected: {0}")]
    Rejected(String),

    /// Anything else
    #[error("handler failed: {0}")]
    Failed(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

impl From<EventKindError> for HandlerError {
    fn from(err: EventKindError) -> Self {
        match err {
            EventKindError::UnknownType(event_type) => HandlerError::UnknownEventType(event_type),
            payload @ EventKindError::Payload { .. } => HandlerError::Decode(payload.to_string()),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

type Handler = Box<dyn Fn(&InboxEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Immutable event-type → handler map, built once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event_type`. Returns `self` for chaining.
    pub fn on<F>(mut self, event_type: &str, handler: F) -> Self
    where
        F: Fn(&InboxEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.to_string(), Box::new(handler));
        self
    }

    /// Register a handler that receives the payload decoded as `P`.
    ///
    /// A payload that does not decode fails with [`HandlerError::Decode`].
    pub fn on_payload<P, F>(self, event_type: &str, handler: F) -> Self
    where
        P: DeserializeOwned,
        F: Fn(P, &InboxEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.on(event_type, move |event| {
            let payload = P::deserialize(&event.payload)?;
            handler(payload, event)
        })
    }

    /// Dispatch one inbox row to its handler.
    pub fn handle(&self, event: &InboxEvent) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(&event.event_type)
            .ok_or_else(|| HandlerError::UnknownEventType(event.event_type.clone()))?;
        handler(event)
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types.
    pub fn event_types(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
