use thiserror::Error;

/// Errors raised by a broker transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The broker could not be reached
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Published to an exchange the broker does not know
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    /// The broker refused the message
    #[error("message rejected by broker: {0}")]
    Rejected(String),

    /// The envelope could not be serialized
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A delivery body is not a valid envelope
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A lock guarding in-process broker state was poisoned
    #[error("broker lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// The subscription or connection was closed
    #[error("subscription closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
