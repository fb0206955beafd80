use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::records::{
    CandidateOrder, CandidateQuery, InboxEvent, InboxStatus, JobStatus, NewInboxEvent,
    NewOutboxEvent, OutboxEvent, ProcessingJob, ProcessingStep, Scene,
};
use super::{InboxLog, JobLog, OutboxLog, Store, StoreError, StoreResult, UnitOfWork};

#[derive(Clone, Default)]
struct Tables {
    outbox: Vec<OutboxEvent>,
    inbox: Vec<InboxEvent>,
    idempotency_keys: HashSet<String>,
    jobs: HashMap<Uuid, ProcessingJob>,
    scenes: Vec<Scene>,
}

/// In-process store for tests and single-process deployments.
///
/// Thread-safe: clones share the same tables via `Arc<Mutex<...>>`. A unit
/// of work holds the table lock for its whole lifetime and edits a working
/// copy that replaces the shared tables on commit, so uncommitted writes are
/// never visible and concurrent writers are serialised.
#[derive(Clone, Default)]
pub struct HashMapStore {
    tables: Arc<Mutex<Tables>>,
}

impl HashMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every outbox row in insertion order.
    pub fn outbox_rows(&self) -> StoreResult<Vec<OutboxEvent>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(tables.outbox.clone())
    }

    /// Snapshot of every inbox row in insertion order.
    pub fn inbox_rows(&self) -> StoreResult<Vec<InboxEvent>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::LockPoisoned("inbox read"))?;
        Ok(tables.inbox.clone())
    }
}

impl Store for HashMapStore {
    type Uow<'a> = HashMapUnitOfWork<'a>;

    fn begin(&self) -> StoreResult<HashMapUnitOfWork<'_>> {
        let guard = self
            .tables
            .lock()
            .map_err(|_| StoreError::LockPoisoned("begin"))?;
        let working = guard.clone();
        Ok(HashMapUnitOfWork { guard, working })
    }
}

/// Unit of work over a [`HashMapStore`].
pub struct HashMapUnitOfWork<'a> {
    guard: MutexGuard<'a, Tables>,
    working: Tables,
}

impl HashMapUnitOfWork<'_> {
    fn inbox_mut(&mut self, id: Uuid) -> Option<&mut InboxEvent> {
        self.working.inbox.iter_mut().find(|e| e.id == id)
    }
}

impl UnitOfWork for HashMapUnitOfWork<'_> {
    fn commit(mut self) -> StoreResult<()> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}

impl OutboxLog for HashMapUnitOfWork<'_> {
    fn insert_outbox(&mut self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        let event = event.into_event(Utc::now());
        self.working.outbox.push(event.clone());
        Ok(event)
    }

    fn unpublished_outbox(&mut self, limit: usize) -> StoreResult<Vec<OutboxEvent>> {
        let mut rows: Vec<OutboxEvent> = self
            .working
            .outbox
            .iter()
            .filter(|e| !e.published)
            .cloned()
            .collect();
        // stable: ties keep insertion order
        rows.sort_by_key(|e| e.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    fn mark_outbox_published(&mut self, ids: &[Uuid], now: DateTime<Utc>) -> StoreResult<usize> {
        let mut updated = 0;
        for event in self.working.outbox.iter_mut() {
            if !event.published && ids.contains(&event.id) {
                event.published = true;
                event.published_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn record_outbox_failure(&mut self, id: Uuid, error: &str) -> StoreResult<bool> {
        match self.working.outbox.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                event.retry_count = event.retry_count.saturating_add(1);
                event.last_error = Some(error.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn outbox_over_threshold(&mut self, threshold: u32) -> StoreResult<Vec<OutboxEvent>> {
        Ok(self
            .working
            .outbox
            .iter()
            .filter(|e| !e.published && e.retry_count >= threshold)
            .cloned()
            .collect())
    }

    fn purge_published_outbox(&mut self, before: DateTime<Utc>) -> StoreResult<usize> {
        let len = self.working.outbox.len();
        self.working.outbox.retain(|e| {
            !(e.published && e.published_at.map(|at| at < before).unwrap_or(false))
        });
        Ok(len - self.working.outbox.len())
    }

    fn outbox_event(&mut self, id: Uuid) -> StoreResult<Option<OutboxEvent>> {
        Ok(self.working.outbox.iter().find(|e| e.id == id).cloned())
    }
}

impl InboxLog for HashMapUnitOfWork<'_> {
    fn insert_inbox(
        &mut self,
        event: NewInboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<InboxEvent>> {
        if let Some(key) = &event.idempotency_key {
            // The key set is the unique index; check and insert happen under the same lock.
            if !self.working.idempotency_keys.insert(key.clone()) {
                return Ok(None);
            }
        }
        let event = event.into_event(now);
        self.working.inbox.push(event.clone());
        Ok(Some(event))
    }

    fn inbox_candidates(&mut self, query: &CandidateQuery) -> StoreResult<Vec<InboxEvent>> {
        let mut rows: Vec<InboxEvent> = self
            .working
            .inbox
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        match query.order {
            CandidateOrder::Arrival => rows.sort_by_key(|e| e.created_at),
            CandidateOrder::Series => rows.sort_by(|a, b| {
                (&a.correlation_id, a.sequence_number, a.created_at).cmp(&(
                    &b.correlation_id,
                    b.sequence_number,
                    b.created_at,
                ))
            }),
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn series_status(
        &mut self,
        correlation_id: &str,
        sequence_number: i64,
    ) -> StoreResult<Option<InboxStatus>> {
        Ok(self
            .working
            .inbox
            .iter()
            .filter(|e| {
                e.correlation_id.as_deref() == Some(correlation_id)
                    && e.sequence_number == Some(sequence_number)
            })
            .map(|e| e.status)
            .max_by_key(InboxStatus::rank))
    }

    fn lease_inbox(
        &mut self,
        ids: &[Uuid],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut leased = 0;
        for event in self.working.inbox.iter_mut() {
            if event.is_pending() && ids.contains(&event.id) {
                event.locked_until = Some(until);
                event.updated_at = now;
                leased += 1;
            }
        }
        Ok(leased)
    }

    fn complete_inbox(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        match self.inbox_mut(id) {
            Some(event) if event.is_pending() => {
                event.status = InboxStatus::Processed;
                event.processed_at = Some(now);
                event.locked_until = None;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn fail_inbox(
        &mut self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.inbox_mut(id) {
            Some(event) if event.is_pending() => {
                event.retry_count = event.retry_count.saturating_add(1);
                event.last_error = Some(error.to_string());
                event.locked_until = Some(retry_at);
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn dead_letter_inbox(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.inbox_mut(id) {
            Some(event) if event.is_pending() => {
                event.status = InboxStatus::DeadLetter;
                event.processed_at = Some(now);
                event.locked_until = None;
                event.last_error = Some(error.to_string());
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn dead_letters(&mut self, limit: usize) -> StoreResult<Vec<InboxEvent>> {
        let mut rows: Vec<InboxEvent> = self
            .working
            .inbox
            .iter()
            .filter(|e| e.is_dead_letter())
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    fn replay_dead_letter(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        match self.inbox_mut(id) {
            Some(event) if event.is_dead_letter() => {
                event.status = InboxStatus::Pending;
                event.processed_at = None;
                event.retry_count = 0;
                event.locked_until = None;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn purge_processed_inbox(&mut self, before: DateTime<Utc>) -> StoreResult<usize> {
        let Tables {
            inbox,
            idempotency_keys,
            ..
        } = &mut self.working;
        let len = inbox.len();
        inbox.retain(|e| {
            let expired =
                e.is_processed() && e.processed_at.map(|at| at < before).unwrap_or(false);
            if expired {
                if let Some(key) = &e.idempotency_key {
                    idempotency_keys.remove(key);
                }
            }
            !expired
        });
        Ok(len - inbox.len())
    }

    fn inbox_event(&mut self, id: Uuid) -> StoreResult<Option<InboxEvent>> {
        Ok(self.working.inbox.iter().find(|e| e.id == id).cloned())
    }
}

impl JobLog for HashMapUnitOfWork<'_> {
    fn insert_job(&mut self, job: &ProcessingJob) -> StoreResult<()> {
        self.working.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn job(&mut self, id: Uuid) -> StoreResult<Option<ProcessingJob>> {
        Ok(self.working.jobs.get(&id).cloned())
    }

    fn set_job_status(
        &mut self,
        id: Uuid,
        status: JobStatus,
        step: Option<ProcessingStep>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.working.jobs.get_mut(&id) {
            Some(job) => {
                job.status = status;
                if step.is_some() {
                    job.current_step = step;
                }
                if matches!(status, JobStatus::Completed | JobStatus::Approved) {
                    job.completed_at = Some(now);
                }
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert_scene(&mut self, scene: &Scene) -> StoreResult<()> {
        if !self.working.jobs.contains_key(&scene.job_id) {
            return Err(StoreError::NotFound(format!("job {}", scene.job_id)));
        }
        self.working.scenes.push(scene.clone());
        Ok(())
    }

    fn scenes_for_job(&mut self, job_id: Uuid) -> StoreResult<Vec<Scene>> {
        let mut scenes: Vec<Scene> = self
            .working
            .scenes
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        scenes.sort_by_key(|s| s.scene_number);
        Ok(scenes)
    }
}
