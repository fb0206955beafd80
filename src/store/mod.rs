//! Per-service relational storage: outbox, inbox and pipeline job tables.
//!
//! All writes go through a [`UnitOfWork`] obtained from [`Store::begin`].
//! A unit of work is one transaction: `commit()` makes every write visible
//! at once, dropping it without committing rolls everything back.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Store::begin() -> UnitOfWork             │
//! │   OutboxLog        InboxLog             JobLog            │
//! │   insert/publish   land/claim/settle    jobs + scenes     │
//! └──────────────────────────────────────────────────────────┘
//!            │                         │
//!            ▼                         ▼
//!   ┌─────────────────┐      ┌─────────────────────┐
//!   │  HashMapStore   │      │     SqliteStore     │
//!   │  (in-process)   │      │ (feature "sqlite")  │
//!   └─────────────────┘      └─────────────────────┘
//! ```
//!
//! Units of work against the same store serialise writers. Claiming inbox
//! rows (select candidates, then set their lease) happens inside one unit of
//! work, so a row leased by one worker is skipped by every other worker
//! until its lease expires.

mod error;
mod memory;
mod records;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use error::{StoreError, StoreResult};
pub use memory::HashMapStore;
pub use records::{
    CandidateOrder, CandidateQuery, InboxEvent, InboxStatus, JobStatus, NewInboxEvent,
    NewOutboxEvent, OutboxEvent, ProcessingJob, ProcessingStep, Scene,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Outbox table operations.
pub trait OutboxLog {
    /// Stage one outbox row. Durable only if the unit of work commits.
    fn insert_outbox(&mut self, event: NewOutboxEvent) -> StoreResult<OutboxEvent>;

    /// Unpublished rows, oldest first.
    fn unpublished_outbox(&mut self, limit: usize) -> StoreResult<Vec<OutboxEvent>>;

    /// Mark exactly the given rows published. Returns the number updated.
    fn mark_outbox_published(&mut self, ids: &[Uuid], now: DateTime<Utc>) -> StoreResult<usize>;

    /// Bump `retry_count` and record `error`, leaving the row unpublished.
    fn record_outbox_failure(&mut self, id: Uuid, error: &str) -> StoreResult<bool>;

    /// Unpublished rows whose `retry_count` reached `threshold`.
    fn outbox_over_threshold(&mut self, threshold: u32) -> StoreResult<Vec<OutboxEvent>>;

    /// Delete published rows published before `before`.
    fn purge_published_outbox(&mut self, before: DateTime<Utc>) -> StoreResult<usize>;

    fn outbox_event(&mut self, id: Uuid) -> StoreResult<Option<OutboxEvent>>;
}

/// Inbox table operations.
pub trait InboxLog {
    /// Land an inbound event.
    ///
    /// Returns `None` when a row with the same idempotency key already
    /// exists; the existing row is left untouched.
    fn insert_inbox(
        &mut self,
        event: NewInboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<InboxEvent>>;

    /// Pending, unleased rows under the retry budget.
    fn inbox_candidates(&mut self, query: &CandidateQuery) -> StoreResult<Vec<InboxEvent>>;

    /// Best status among rows of a series position, or `None` if no row exists.
    ///
    /// `Processed` wins over `DeadLetter`, which wins over `Pending`.
    fn series_status(
        &mut self,
        correlation_id: &str,
        sequence_number: i64,
    ) -> StoreResult<Option<InboxStatus>>;

    /// Set the lease of pending rows to `until`. Returns the number leased.
    fn lease_inbox(
        &mut self,
        ids: &[Uuid],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    /// Mark a row processed and clear its lease.
    fn complete_inbox(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Count a failed attempt; the row becomes claimable again at `retry_at`.
    fn fail_inbox(
        &mut self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Park a row in the terminal dead-letter state.
    fn dead_letter_inbox(&mut self, id: Uuid, error: &str, now: DateTime<Utc>)
        -> StoreResult<bool>;

    /// Dead-lettered rows, oldest first.
    fn dead_letters(&mut self, limit: usize) -> StoreResult<Vec<InboxEvent>>;

    /// Move a dead-lettered row back to pending with a fresh retry budget.
    fn replay_dead_letter(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Delete processed rows processed before `before`. Dead letters are kept.
    fn purge_processed_inbox(&mut self, before: DateTime<Utc>) -> StoreResult<usize>;

    fn inbox_event(&mut self, id: Uuid) -> StoreResult<Option<InboxEvent>>;
}

/// Processing job and scene table operations.
pub trait JobLog {
    fn insert_job(&mut self, job: &ProcessingJob) -> StoreResult<()>;

    fn job(&mut self, id: Uuid) -> StoreResult<Option<ProcessingJob>>;

    fn set_job_status(
        &mut self,
        id: Uuid,
        status: JobStatus,
        step: Option<ProcessingStep>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    fn insert_scene(&mut self, scene: &Scene) -> StoreResult<()>;

    /// Scenes of a job in ascending `scene_number`.
    fn scenes_for_job(&mut self, job_id: Uuid) -> StoreResult<Vec<Scene>>;
}

/// One transaction over a service's tables.
pub trait UnitOfWork: OutboxLog + InboxLog + JobLog {
    /// Make all staged writes visible at once.
    fn commit(self) -> StoreResult<()>;
}

/// A per-service database.
///
/// Cloning a store yields another handle to the same tables.
pub trait Store: Send + Sync {
    type Uow<'a>: UnitOfWork
    where
        Self: 'a;

    /// Open a unit of work. Blocks while another writer holds one.
    fn begin(&self) -> StoreResult<Self::Uow<'_>>;
}

/// Run `f` inside a unit of work, committing only when it returns `Ok`.
pub fn transaction<'s, S, T, E, F>(store: &'s S, f: F) -> Result<T, E>
where
    S: Store,
    E: From<StoreError>,
    F: FnOnce(&mut S::Uow<'s>) -> Result<T, E>,
{
    let mut uow = store.begin()?;
    let value = f(&mut uow)?;
    uow.commit()?;
    Ok(value)
}

// Stored timestamps must keep four-digit years to stay lexically ordered.
const HORIZON_DAYS: i64 = 365 * 1000;

fn bounded(span: Duration) -> chrono::Duration {
    let horizon = chrono::Duration::days(HORIZON_DAYS);
    chrono::Duration::from_std(span)
        .map(|d| d.min(horizon))
        .unwrap_or(horizon)
}

/// `now + after`, capped a thousand years out.
pub(crate) fn instant_after(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    now + bounded(after)
}

/// `now - retention`, capped a thousand years back.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    now - bounded(retention)
}
