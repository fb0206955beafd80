use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::HandlerRegistry;
use super::resolver::{OrderingResolver, SelectionMode};
use crate::config::InboxConfig;
use crate::retry::{dead_letter_reason, FailureOutcome, FixedDelay, RetryPolicy};
use crate::store::{
    instant_after, retention_cutoff, CandidateQuery, InboxEvent, InboxLog, Store, StoreResult,
    UnitOfWork,
};

/// Outcome of one processing cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessStats {
    /// Rows leased this cycle.
    pub selected: usize,
    pub succeeded: usize,
    /// Failures that will be retried.
    pub failed: usize,
    pub dead_lettered: usize,
    /// Claimable rows left waiting on a predecessor.
    pub deferred: usize,
    /// `(event id, error)` for every failed or dead-lettered row.
    pub errors: Vec<(Uuid, String)>,
}

impl ProcessStats {
    pub fn merge(&mut self, other: ProcessStats) {
        self.selected += other.selected;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.errors.extend(other.errors);
    }
}

/// Claims pending inbox rows, runs their handlers and records the outcome.
///
/// A cycle has two phases:
///
/// 1. **Claim**, in one unit of work: read candidates, drop the ones whose
///    predecessor has not been processed, lease the rest until
///    `now + lease`. Concurrent processors never lease the same row.
/// 2. **Handle**, outside any transaction: run each leased row's handler
///    and settle it in its own unit of work (processed, retry later, or dead
///    letter once the retry budget is spent).
///
/// A processor that dies mid-cycle leaves its leases behind; they expire and
/// the rows become claimable again.
pub struct InboxProcessor<S> {
    store: S,
    handlers: Arc<HandlerRegistry>,
    batch_size: usize,
    max_retries: u32,
    lease: Duration,
    resolver: OrderingResolver,
    retry: Option<Arc<dyn RetryPolicy>>,
}

impl<S> InboxProcessor<S> {
    pub fn new(store: S, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            handlers,
            batch_size: 10,
            max_retries: 5,
            lease: Duration::from_secs(10 * 60),
            resolver: OrderingResolver::default(),
            retry: None,
        }
    }

    /// Apply batch size, retry budget, lease and ordering from configuration.
    pub fn with_config(self, config: &InboxConfig) -> Self {
        self.with_batch_size(config.batch_size)
            .with_max_retries(config.max_retries)
            .with_lease(config.lease)
            .with_ordering(config.ordering, config.first_sequence)
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Attempts allowed before a row is dead-lettered.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// How long a claimed row stays invisible to other processors.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_ordering(mut self, mode: SelectionMode, first_sequence: i64) -> Self {
        self.resolver = OrderingResolver::new(mode, first_sequence);
        self
    }

    /// Delay before a failed row is retried, by attempt. Defaults to the
    /// lease duration.
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        match &self.retry {
            Some(policy) => policy.delay(attempt),
            None => FixedDelay::new(self.lease).delay(attempt),
        }
    }
}

impl<S: Store> InboxProcessor<S> {
    /// Lease up to `batch_size` eligible rows. Returns the leased rows and
    /// the number of candidates left waiting on ordering.
    pub fn claim(&self) -> StoreResult<(Vec<InboxEvent>, usize)> {
        let now = Utc::now();
        let mut uow = self.store.begin()?;

        let query = CandidateQuery::new(self.max_retries, now)
            .with_order(self.resolver.mode().candidate_order());
        let query = match self.resolver.mode() {
            SelectionMode::Unordered => query.with_limit(self.batch_size),
            // ordering may skip rows, so scan everything claimable
            SelectionMode::Sequential => query,
        };
        let candidates = uow.inbox_candidates(&query)?;
        let resolution = self.resolver.resolve(&mut uow, candidates, self.batch_size)?;

        let ids: Vec<Uuid> = resolution.eligible.iter().map(|e| e.id).collect();
        if ids.is_empty() {
            return Ok((Vec::new(), resolution.deferred));
        }
        let until = instant_after(now, self.lease);
        uow.lease_inbox(&ids, until, now)?;
        uow.commit()?;

        let leased = resolution
            .eligible
            .into_iter()
            .map(|mut event| {
                event.locked_until = Some(until);
                event
            })
            .collect();
        Ok((leased, resolution.deferred))
    }

    /// Run one processing cycle.
    pub fn process_pending(&self) -> StoreResult<ProcessStats> {
        let (leased, deferred) = self.claim()?;
        let mut stats = ProcessStats {
            selected: leased.len(),
            deferred,
            ..Default::default()
        };
        if leased.is_empty() {
            return Ok(stats);
        }

        for event in &leased {
            match self.handlers.handle(event) {
                Ok(()) => {
                    self.settle_success(event)?;
                    stats.succeeded += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    match self.settle_failure(event, &message)? {
                        FailureOutcome::DeadLetter => stats.dead_lettered += 1,
                        FailureOutcome::Retry { .. } => stats.failed += 1,
                    }
                    stats.errors.push((event.id, message));
                }
            }
        }

        info!(
            selected = stats.selected,
            succeeded = stats.succeeded,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            deferred = stats.deferred,
            "Inbox cycle complete"
        );
        Ok(stats)
    }

    fn settle_success(&self, event: &InboxEvent) -> StoreResult<()> {
        let mut uow = self.store.begin()?;
        uow.complete_inbox(event.id, Utc::now())?;
        uow.commit()?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Inbox event processed");
        Ok(())
    }

    fn settle_failure(&self, event: &InboxEvent, message: &str) -> StoreResult<FailureOutcome> {
        let now = Utc::now();
        let outcome = FailureOutcome::classify(event.retry_count, self.max_retries);
        let mut uow = self.store.begin()?;
        match outcome {
            FailureOutcome::DeadLetter => {
                let reason = dead_letter_reason(event.retry_count, message);
                uow.dead_letter_inbox(event.id, &reason, now)?;
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    error = %message,
                    "Inbox event dead-lettered"
                );
            }
            FailureOutcome::Retry { retry_count } => {
                let retry_at = instant_after(now, self.retry_delay(event.retry_count));
                uow.fail_inbox(event.id, message, retry_at, now)?;
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count,
                    max_retries = self.max_retries,
                    error = %message,
                    "Inbox handler failed"
                );
            }
        }
        uow.commit()?;
        Ok(outcome)
    }

    /// Dead-lettered rows, oldest first.
    pub fn dead_letters(&self, limit: usize) -> StoreResult<Vec<InboxEvent>> {
        self.store.begin()?.dead_letters(limit)
    }

    /// Return a dead-lettered row to pending with a fresh retry budget.
    ///
    /// Returns `false` when the row does not exist or is not dead-lettered.
    pub fn replay(&self, id: Uuid) -> StoreResult<bool> {
        let mut uow = self.store.begin()?;
        let replayed = uow.replay_dead_letter(id, Utc::now())?;
        uow.commit()?;
        if replayed {
            info!(event_id = %id, "Dead letter replayed");
        }
        Ok(replayed)
    }

    /// Delete rows processed longer than `retention` ago.
    pub fn cleanup(&self, retention: Duration) -> StoreResult<usize> {
        let cutoff = retention_cutoff(Utc::now(), retention);
        let mut uow = self.store.begin()?;
        let deleted = uow.purge_processed_inbox(cutoff)?;
        uow.commit()?;
        if deleted > 0 {
            info!(deleted, "Inbox cleanup");
        }
        Ok(deleted)
    }
}
