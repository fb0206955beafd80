use std::collections::HashMap;

use serde_json::Value;

use super::IdempotencyKey;

/// Payload fields that identify an event's series.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeriesKeySpec {
    pub correlation_field: String,
    pub sequence_field: String,
    /// Field keyed on when the series fields are missing.
    pub fallback_field: Option<String>,
}

impl SeriesKeySpec {
    pub fn new(correlation_field: impl Into<String>, sequence_field: impl Into<String>) -> Self {
        Self {
            correlation_field: correlation_field.into(),
            sequence_field: sequence_field.into(),
            fallback_field: None,
        }
    }

    pub fn with_fallback(mut self, field: impl Into<String>) -> Self {
        self.fallback_field = Some(field.into());
        self
    }
}

/// Where an event type is published and how it is keyed on arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRoute {
    pub exchange: String,
    pub routing_key: String,
    pub series: Option<SeriesKeySpec>,
}

impl EventRoute {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            series: None,
        }
    }

    pub fn with_series(mut self, series: SeriesKeySpec) -> Self {
        self.series = Some(series);
        self
    }
}

/// Immutable event-type → route table, built once at startup and shared by
/// the publisher and the consumers.
#[derive(Clone, Debug, Default)]
pub struct EventRegistry {
    routes: HashMap<String, EventRoute>,
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    pub fn route(&self, event_type: &str) -> Option<&EventRoute> {
        self.routes.get(event_type)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Idempotency and ordering keys for an inbound payload.
    ///
    /// Unregistered types get no key.
    pub fn derive_keys(&self, event_type: &str, payload: &Value) -> IdempotencyKey {
        let spec = self.route(event_type).and_then(|r| r.series.as_ref());
        IdempotencyKey::derive(event_type, spec, payload)
    }
}

#[derive(Debug, Default)]
pub struct EventRegistryBuilder {
    routes: HashMap<String, EventRoute>,
}

impl EventRegistryBuilder {
    /// Register a route. A later registration for the same type replaces it.
    pub fn route(mut self, event_type: impl Into<String>, route: EventRoute) -> Self {
        self.routes.insert(event_type.into(), route);
        self
    }

    pub fn build(self) -> EventRegistry {
        EventRegistry {
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_routes_and_keys() {
        let registry = EventRegistry::builder()
            .route(
                "scene.saved",
                EventRoute::new("scene_saved_events", "scene.saved")
                    .with_series(SeriesKeySpec::new("document_id", "scene_number")),
            )
            .route("job.completed", EventRoute::new("job_completed_events", "job.completed"))
            .build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.event_types(), vec!["job.completed", "scene.saved"]);
        assert_eq!(
            registry.route("scene.saved").map(|r| r.exchange.as_str()),
            Some("scene_saved_events")
        );
        assert!(registry.route("unknown").is_none());

        let keys = registry.derive_keys("scene.saved", &json!({"document_id": "d", "scene_number": 2}));
        assert_eq!(keys.key.as_deref(), Some("scene.saved:d:2"));
        assert_eq!(registry.derive_keys("unknown", &json!({"document_id": "d"})).key, None);
    }
}
