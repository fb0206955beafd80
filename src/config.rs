//! Relay settings.
//!
//! Defaults suit a single service polling every few seconds. Every value can
//! be overridden through `RELAY_*` environment variables:
//!
//! | Variable | Default |
//! |---|---|
//! | `RELAY_OUTBOX_BATCH_SIZE` | 100 |
//! | `RELAY_OUTBOX_POLL_INTERVAL_MS` | 3000 |
//! | `RELAY_OUTBOX_RETENTION_SECS` | 7 days |
//! | `RELAY_OUTBOX_ALERT_THRESHOLD` | 3 |
//! | `RELAY_INBOX_BATCH_SIZE` | 10 |
//! | `RELAY_INBOX_MAX_RETRIES` | 5 |
//! | `RELAY_INBOX_LEASE_SECS` | 600 |
//! | `RELAY_INBOX_POLL_INTERVAL_MS` | 3000 |
//! | `RELAY_INBOX_RETENTION_SECS` | 7 days |
//! | `RELAY_INBOX_ORDERING` | `sequential` |
//! | `RELAY_INBOX_FIRST_SEQUENCE` | 1 |
//! | `RELAY_CLEANUP_INTERVAL_SECS` | 3600 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::inbox::SelectionMode;

const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// How long published rows are kept.
    pub retention: Duration,
    /// `retry_count` at which a row is reported as stalled.
    pub alert_threshold: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(3),
            retention: WEEK,
            alert_threshold: 3,
        }
    }
}

impl OutboxConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_alert_threshold(mut self, threshold: u32) -> Self {
        self.alert_threshold = threshold;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboxConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub lease: Duration,
    pub poll_interval: Duration,
    /// How long processed rows are kept. Dead letters are never purged.
    pub retention: Duration,
    pub ordering: SelectionMode,
    pub first_sequence: i64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 5,
            lease: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(3),
            retention: WEEK,
            ordering: SelectionMode::Sequential,
            first_sequence: 1,
        }
    }
}

impl InboxConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_ordering(mut self, ordering: SelectionMode) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_first_sequence(mut self, first_sequence: i64) -> Self {
        self.first_sequence = first_sequence;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    pub outbox: OutboxConfig,
    pub inbox: InboxConfig,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxConfig::default(),
            inbox: InboxConfig::default(),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RelayConfig {
    pub fn with_outbox(mut self, outbox: OutboxConfig) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn with_inbox(mut self, inbox: InboxConfig) -> Self {
        self.inbox = inbox;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Lookup(lookup);
        let defaults = Self::default();

        let outbox = OutboxConfig {
            batch_size: vars.parse("RELAY_OUTBOX_BATCH_SIZE", defaults.outbox.batch_size)?,
            poll_interval: vars.millis("RELAY_OUTBOX_POLL_INTERVAL_MS", defaults.outbox.poll_interval)?,
            retention: vars.secs("RELAY_OUTBOX_RETENTION_SECS", defaults.outbox.retention)?,
            alert_threshold: vars
                .parse("RELAY_OUTBOX_ALERT_THRESHOLD", defaults.outbox.alert_threshold)?,
        };
        let inbox = InboxConfig {
            batch_size: vars.parse("RELAY_INBOX_BATCH_SIZE", defaults.inbox.batch_size)?,
            max_retries: vars.parse("RELAY_INBOX_MAX_RETRIES", defaults.inbox.max_retries)?,
            lease: vars.secs("RELAY_INBOX_LEASE_SECS", defaults.inbox.lease)?,
            poll_interval: vars.millis("RELAY_INBOX_POLL_INTERVAL_MS", defaults.inbox.poll_interval)?,
            retention: vars.secs("RELAY_INBOX_RETENTION_SECS", defaults.inbox.retention)?,
            ordering: vars.parse("RELAY_INBOX_ORDERING", defaults.inbox.ordering)?,
            first_sequence: vars.parse("RELAY_INBOX_FIRST_SEQUENCE", defaults.inbox.first_sequence)?,
        };

        Ok(Self {
            outbox,
            inbox,
            cleanup_interval: vars.secs("RELAY_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
        })
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}
