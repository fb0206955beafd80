use thiserror::Error;

/// Why a relay could not start.
#[derive(Error, Debug)]
pub enum StartError {
    /// A subscription named an event type the registry has no route for.
    #[error("no route for event type {0}")]
    UnknownEventType(String),

    /// A worker thread could not be spawned.
    #[error("failed to spawn {worker}: {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },
}
