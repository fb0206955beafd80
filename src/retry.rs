//! Retry policies: attempt number → delay.
//!
//! Used in two places:
//! - around a single transport publish ([`retry_with`], bounded, sleeps inline)
//! - for failed inbox rows, where the delay becomes the row's next lease
//!   expiry instead of a sleep

use std::fmt::Debug;
use std::time::Duration;

use tracing::warn;

/// Maps a 0-based retry attempt to the delay before it.
pub trait RetryPolicy: Debug + Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;

    /// Retries allowed after the first try. `None` means unbounded.
    fn max_retries(&self) -> Option<u32> {
        None
    }
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for std::sync::Arc<P> {
    fn delay(&self, attempt: u32) -> Duration {
        (**self).delay(attempt)
    }

    fn max_retries(&self) -> Option<u32> {
        (**self).max_retries()
    }
}

/// `start + step * attempt`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearBackoff {
    pub start: Duration,
    pub step: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl LinearBackoff {
    pub fn new(start: Duration, step: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            start,
            step,
            max,
            max_retries,
        }
    }

    /// Retries immediately, `max_retries` times.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, max_retries)
    }
}

impl Default for LinearBackoff {
    /// 0s, 2s, 4s ... capped at 30s, three retries.
    fn default() -> Self {
        Self::new(
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(30),
            3,
        )
    }
}

impl RetryPolicy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.start
            .saturating_add(self.step.saturating_mul(attempt))
            .min(self.max)
    }

    fn max_retries(&self) -> Option<u32> {
        Some(self.max_retries)
    }
}

/// `base * 2^attempt`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        // exponent capped to keep the multiplier in range
        let factor = 2_u32.saturating_pow(attempt.min(20));
        self.base.saturating_mul(factor).min(self.max)
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }
}

/// Same delay for every attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_retries: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_retries: None,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }
}

/// Run `op` until it succeeds, the error is not retryable, or the policy's
/// retry budget is spent. `op` receives the 0-based attempt number.
///
/// Blocks the calling thread between attempts.
pub fn retry_with<T, E, F, R>(policy: &dyn RetryPolicy, is_retryable: R, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => {
                let exhausted = policy.max_retries().map(|m| attempt >= m).unwrap_or(false);
                if exhausted || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay(attempt);
                warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// What happens to an inbox row whose handler just failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Count the failure; the row is retried later.
    Retry { retry_count: u32 },
    /// Budget spent; park the row.
    DeadLetter,
}

impl FailureOutcome {
    /// A failure at `retry_count` is the last one once `retry_count + 1`
    /// reaches `max_retries`.
    pub fn classify(retry_count: u32, max_retries: u32) -> Self {
        let next = retry_count.saturating_add(1);
        if next >= max_retries {
            FailureOutcome::DeadLetter
        } else {
            FailureOutcome::Retry { retry_count: next }
        }
    }
}

/// Annotation stored on a dead-lettered row.
pub fn dead_letter_reason(retry_count: u32, error: &str) -> String {
    format!("FAILED after {} retries: {}", retry_count, error)
}
