use serde_json::Value;

use super::SeriesKeySpec;

/// Keys derived from an inbound payload.
///
/// `key` deduplicates deliveries; `correlation_id`/`sequence_number` place the
/// row in its series for ordered processing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdempotencyKey {
    pub key: Option<String>,
    pub correlation_id: Option<String>,
    pub sequence_number: Option<i64>,
}

impl IdempotencyKey {
    /// Derive keys for `event_type` from `payload`.
    ///
    /// `"<event_type>:<correlation>:<sequence>"` when both series fields are
    /// present, else `"<event_type>:<fallback_field>:<value>"` when the
    /// fallback field is present, else no key at all.
    pub fn derive(event_type: &str, spec: Option<&SeriesKeySpec>, payload: &Value) -> Self {
        let Some(spec) = spec else {
            return Self::default();
        };

        let correlation = payload.get(&spec.correlation_field).and_then(scalar_text);
        let sequence = payload.get(&spec.sequence_field).and_then(integer);

        if let (Some(correlation), Some(sequence)) = (correlation, sequence) {
            return Self {
                key: Some(format!("{}:{}:{}", event_type, correlation, sequence)),
                correlation_id: Some(correlation),
                sequence_number: Some(sequence),
            };
        }

        let key = spec.fallback_field.as_deref().and_then(|field| {
            payload
                .get(field)
                .and_then(scalar_text)
                .map(|value| format!("{}:{}:{}", event_type, field, value))
        });
        Self {
            key,
            ..Self::default()
        }
    }

    pub fn has_series(&self) -> bool {
        self.correlation_id.is_some() && self.sequence_number.is_some()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
