//! One service's relay, wired and running.
//!
//! `RelayService` starts the background pieces a pipeline service needs
//! around its own store:
//!
//! - an outbox publisher thread
//! - an inbox processor thread
//! - a cleanup thread purging old published and processed rows
//! - one consumer thread per subscription
//!
//! The threads share nothing but the store and the transport.
//!
//! ```ignore
//! let relay = RelayService::new(store, broker, Arc::new(pipeline_registry()))
//!     .with_handlers(handlers)
//!     .with_config(RelayConfig::from_env()?)
//!     .subscribe_event(SCENE_SAVED, "prompt_extraction.scene_saved")
//!     .start()?;
//!
//! // ... later
//! let stats = relay.stop();
//! ```

mod error;
mod relay;

pub use error::StartError;
pub use relay::{CleanupStats, RelayHandle, RelayService, RelayStats, SubscriptionSpec};
