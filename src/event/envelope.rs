use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire format of every message on the broker.
///
/// ```json
/// { "event_type": "scene.saved", "timestamp": "2026-01-01T00:00:00Z", "payload": { ... } }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to the JSON body sent over the broker.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a broker body. A missing `payload` decodes as an empty object.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Wire {
            event_type: String,
            timestamp: DateTime<Utc>,
            #[serde(default)]
            payload: Option<Value>,
        }

        let wire: Wire = serde_json::from_slice(body)?;
        Ok(Self {
            event_type: wire.event_type,
            timestamp: wire.timestamp,
            payload: wire.payload.unwrap_or_else(|| Value::Object(Default::default())),
        })
    }
}
