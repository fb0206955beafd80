//! SQLite-backed store.
//!
//! One connection per store handle, guarded by a mutex. A unit of work holds
//! the guard and runs inside `BEGIN IMMEDIATE`, so it takes the database
//! write lock up front: two handles opened on the same file (or two
//! processes) serialise their claims, and rows leased by one are skipped by
//! the other. Timestamps are stored as fixed-width RFC 3339 text in UTC so
//! that lexical order is chronological order.

mod migrations;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::warn;
use uuid::Uuid;

use super::records::{
    CandidateOrder, CandidateQuery, InboxEvent, InboxStatus, JobStatus, NewInboxEvent,
    NewOutboxEvent, OutboxEvent, ProcessingJob, ProcessingStep, Scene,
};
use super::{InboxLog, JobLog, OutboxLog, Store, StoreError, StoreResult, UnitOfWork};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const OUTBOX_COLUMNS: &str =
    "id, event_type, payload, published, published_at, retry_count, last_error, created_at";

const INBOX_COLUMNS: &str = "id, event_type, payload, idempotency_key, status, processed_at, \
     retry_count, last_error, locked_until, correlation_id, sequence_number, received_at, \
     created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, document_id, status, current_step, error_message, created_at, updated_at, completed_at";

const SCENE_COLUMNS: &str =
    "id, job_id, scene_number, scene_text, word_count, char_count, created_at";

/// Store over a single SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a database at the given path, running migrations if needed.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl Store for SqliteStore {
    type Uow<'a> = SqliteUnitOfWork<'a>;

    fn begin(&self) -> StoreResult<SqliteUnitOfWork<'_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::LockPoisoned("begin"))?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteUnitOfWork { conn, done: false })
    }
}

/// Unit of work over a [`SqliteStore`]. Rolls back when dropped uncommitted.
pub struct SqliteUnitOfWork<'a> {
    conn: MutexGuard<'a, Connection>,
    done: bool,
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn commit(mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Rollback failed");
            }
        }
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

struct OutboxRow {
    id: String,
    event_type: String,
    payload: String,
    published: bool,
    published_at: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
    created_at: String,
}

impl OutboxRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            payload: row.get(2)?,
            published: row.get(3)?,
            published_at: row.get(4)?,
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_event(self) -> StoreResult<OutboxEvent> {
        Ok(OutboxEvent {
            id: Uuid::parse_str(&self.id)?,
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload)?,
            published: self.published,
            published_at: parse_opt_ts(self.published_at)?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct InboxRow {
    id: String,
    event_type: String,
    payload: String,
    idempotency_key: Option<String>,
    status: String,
    processed_at: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
    locked_until: Option<String>,
    correlation_id: Option<String>,
    sequence_number: Option<i64>,
    received_at: String,
    created_at: String,
    updated_at: String,
}

impl InboxRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            payload: row.get(2)?,
            idempotency_key: row.get(3)?,
            status: row.get(4)?,
            processed_at: row.get(5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
            locked_until: row.get(8)?,
            correlation_id: row.get(9)?,
            sequence_number: row.get(10)?,
            received_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_event(self) -> StoreResult<InboxEvent> {
        Ok(InboxEvent {
            id: Uuid::parse_str(&self.id)?,
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload)?,
            idempotency_key: self.idempotency_key,
            status: self.status.parse().map_err(StoreError::InvalidData)?,
            processed_at: parse_opt_ts(self.processed_at)?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            locked_until: parse_opt_ts(self.locked_until)?,
            correlation_id: self.correlation_id,
            sequence_number: self.sequence_number,
            received_at: parse_ts(&self.received_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct JobRow {
    id: String,
    document_id: String,
    status: String,
    current_step: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            status: row.get(2)?,
            current_step: row.get(3)?,
            error_message: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_job(self) -> StoreResult<ProcessingJob> {
        Ok(ProcessingJob {
            id: Uuid::parse_str(&self.id)?,
            document_id: Uuid::parse_str(&self.document_id)?,
            status: self.status.parse().map_err(StoreError::InvalidData)?,
            current_step: self
                .current_step
                .map(|step| step.parse::<ProcessingStep>())
                .transpose()
                .map_err(StoreError::InvalidData)?,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct SceneRow {
    id: String,
    job_id: String,
    scene_number: i64,
    scene_text: String,
    word_count: i64,
    char_count: i64,
    created_at: String,
}

impl SceneRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            scene_number: row.get(2)?,
            scene_text: row.get(3)?,
            word_count: row.get(4)?,
            char_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_scene(self) -> StoreResult<Scene> {
        Ok(Scene {
            id: Uuid::parse_str(&self.id)?,
            job_id: Uuid::parse_str(&self.job_id)?,
            scene_number: self.scene_number,
            scene_text: self.scene_text,
            word_count: self.word_count,
            char_count: self.char_count,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl SqliteUnitOfWork<'_> {
    fn query_outbox(&self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<Vec<OutboxEvent>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, OutboxRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(OutboxRow::into_event).collect()
    }

    fn query_inbox(&self, sql: &str, params: &[&dyn ToSql]) -> StoreResult<Vec<InboxEvent>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, InboxRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(InboxRow::into_event).collect()
    }
}

impl OutboxLog for SqliteUnitOfWork<'_> {
    fn insert_outbox(&mut self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        let event = event.into_event(Utc::now());
        self.conn.execute(
            "INSERT INTO outbox_events (id, event_type, payload, published, retry_count, created_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4)",
            params![
                event.id.to_string(),
                event.event_type,
                serde_json::to_string(&event.payload)?,
                ts(event.created_at),
            ],
        )?;
        Ok(event)
    }

    fn unpublished_outbox(&mut self, limit: usize) -> StoreResult<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {} FROM outbox_events
             WHERE published = 0
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?1",
            OUTBOX_COLUMNS
        );
        self.query_outbox(&sql, &[&(limit as i64)])
    }

    fn mark_outbox_published(&mut self, ids: &[Uuid], now: DateTime<Utc>) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE outbox_events SET published = 1, published_at = ?1
             WHERE published = 0 AND id IN ({})",
            placeholders(2, ids.len())
        );
        let now = ts(now);
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 1);
        params_vec.push(&now);
        for id in &ids {
            params_vec.push(id);
        }
        Ok(self.conn.execute(&sql, params_vec.as_slice())?)
    }

    fn record_outbox_failure(&mut self, id: Uuid, error: &str) -> StoreResult<bool> {
        let updated = self.conn.execute(
            "UPDATE outbox_events SET retry_count = retry_count + 1, last_error = ?1
             WHERE id = ?2",
            params![error, id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn outbox_over_threshold(&mut self, threshold: u32) -> StoreResult<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {} FROM outbox_events
             WHERE published = 0 AND retry_count >= ?1
             ORDER BY created_at ASC, rowid ASC",
            OUTBOX_COLUMNS
        );
        self.query_outbox(&sql, &[&threshold])
    }

    fn purge_published_outbox(&mut self, before: DateTime<Utc>) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM outbox_events WHERE published = 1 AND published_at < ?1",
            params![ts(before)],
        )?)
    }

    fn outbox_event(&mut self, id: Uuid) -> StoreResult<Option<OutboxEvent>> {
        let sql = format!("SELECT {} FROM outbox_events WHERE id = ?1", OUTBOX_COLUMNS);
        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id.to_string()], OutboxRow::read)
            .optional()?;
        row.map(OutboxRow::into_event).transpose()
    }
}

impl InboxLog for SqliteUnitOfWork<'_> {
    fn insert_inbox(
        &mut self,
        event: NewInboxEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<InboxEvent>> {
        let event = event.into_event(now);
        let inserted = self.conn.execute(
            "INSERT INTO inbox_events (id, event_type, payload, idempotency_key, status,
                 retry_count, correlation_id, sequence_number, received_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                event.id.to_string(),
                event.event_type,
                serde_json::to_string(&event.payload)?,
                event.idempotency_key,
                event.status.as_str(),
                event.correlation_id,
                event.sequence_number,
                ts(event.received_at),
                ts(event.created_at),
            ],
        )?;
        Ok((inserted > 0).then_some(event))
    }

    fn inbox_candidates(&mut self, query: &CandidateQuery) -> StoreResult<Vec<InboxEvent>> {
        let order = match query.order {
            CandidateOrder::Arrival => "created_at ASC, rowid ASC",
            CandidateOrder::Series => {
                "correlation_id ASC, sequence_number ASC, created_at ASC, rowid ASC"
            }
        };
        let sql = format!(
            "SELECT {} FROM inbox_events
             WHERE status = 'pending'
               AND retry_count < ?1
               AND (locked_until IS NULL OR locked_until <= ?2)
             ORDER BY {}
             LIMIT ?3",
            INBOX_COLUMNS, order
        );
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        self.query_inbox(&sql, &[&query.max_retries, &ts(query.now), &limit])
    }

    fn series_status(
        &mut self,
        correlation_id: &str,
        sequence_number: i64,
    ) -> StoreResult<Option<InboxStatus>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT status FROM inbox_events
             WHERE correlation_id = ?1 AND sequence_number = ?2",
        )?;
        let statuses = stmt
            .query_map(params![correlation_id, sequence_number], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut best: Option<InboxStatus> = None;
        for raw in statuses {
            let status: InboxStatus = raw.parse().map_err(StoreError::InvalidData)?;
            if best.map(|b| status.rank() > b.rank()).unwrap_or(true) {
                best = Some(status);
            }
        }
        Ok(best)
    }

    fn lease_inbox(
        &mut self,
        ids: &[Uuid],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE inbox_events SET locked_until = ?1, updated_at = ?2
             WHERE status = 'pending' AND id IN ({})",
            placeholders(3, ids.len())
        );
        let until = ts(until);
        let now = ts(now);
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let mut params_vec: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 2);
        params_vec.push(&until);
        params_vec.push(&now);
        for id in &ids {
            params_vec.push(id);
        }
        Ok(self.conn.execute(&sql, params_vec.as_slice())?)
    }

    fn complete_inbox(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let now = ts(now);
        let updated = self.conn.execute(
            "UPDATE inbox_events
             SET status = 'processed', processed_at = ?1, locked_until = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn fail_inbox(
        &mut self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = self.conn.execute(
            "UPDATE inbox_events
             SET retry_count = retry_count + 1, last_error = ?1, locked_until = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![error, ts(retry_at), ts(now), id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn dead_letter_inbox(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let now = ts(now);
        let updated = self.conn.execute(
            "UPDATE inbox_events
             SET status = 'dead_letter', processed_at = ?1, locked_until = NULL,
                 last_error = ?2, updated_at = ?1
             WHERE id = ?3 AND status = 'pending'",
            params![now, error, id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn dead_letters(&mut self, limit: usize) -> StoreResult<Vec<InboxEvent>> {
        let sql = format!(
            "SELECT {} FROM inbox_events
             WHERE status = 'dead_letter'
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?1",
            INBOX_COLUMNS
        );
        self.query_inbox(&sql, &[&(limit as i64)])
    }

    fn replay_dead_letter(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let updated = self.conn.execute(
            "UPDATE inbox_events
             SET status = 'pending', processed_at = NULL, retry_count = 0,
                 locked_until = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'dead_letter'",
            params![ts(now), id.to_string()],
        )?;
        Ok(updated > 0)
    }

    fn purge_processed_inbox(&mut self, before: DateTime<Utc>) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM inbox_events WHERE status = 'processed' AND processed_at < ?1",
            params![ts(before)],
        )?)
    }

    fn inbox_event(&mut self, id: Uuid) -> StoreResult<Option<InboxEvent>> {
        let sql = format!("SELECT {} FROM inbox_events WHERE id = ?1", INBOX_COLUMNS);
        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id.to_string()], InboxRow::read)
            .optional()?;
        row.map(InboxRow::into_event).transpose()
    }
}

impl JobLog for SqliteUnitOfWork<'_> {
    fn insert_job(&mut self, job: &ProcessingJob) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO processing_jobs (id, document_id, status, current_step, error_message,
                 created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.document_id.to_string(),
                job.status.as_str(),
                job.current_step.map(|step| step.as_str()),
                job.error_message,
                ts(job.created_at),
                ts(job.updated_at),
                job.completed_at.map(ts),
            ],
        )?;
        Ok(())
    }

    fn job(&mut self, id: Uuid) -> StoreResult<Option<ProcessingJob>> {
        let sql = format!("SELECT {} FROM processing_jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![id.to_string()], JobRow::read)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    fn set_job_status(
        &mut self,
        id: Uuid,
        status: JobStatus,
        step: Option<ProcessingStep>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let finished = matches!(status, JobStatus::Completed | JobStatus::Approved);
        let now = ts(now);
        let updated = self.conn.execute(
            "UPDATE processing_jobs
             SET status = ?1,
                 current_step = COALESCE(?2, current_step),
                 completed_at = CASE WHEN ?3 THEN ?4 ELSE completed_at END,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                step.map(|s| s.as_str()),
                finished,
                now,
                id.to_string()
            ],
        )?;
        Ok(updated > 0)
    }

    fn insert_scene(&mut self, scene: &Scene) -> StoreResult<()> {
        if self.job(scene.job_id)?.is_none() {
            return Err(StoreError::NotFound(format!("job {}", scene.job_id)));
        }
        self.conn.execute(
            "INSERT INTO scenes (id, job_id, scene_number, scene_text, word_count, char_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                scene.id.to_string(),
                scene.job_id.to_string(),
                scene.scene_number,
                scene.scene_text,
                scene.word_count,
                scene.char_count,
                ts(scene.created_at),
            ],
        )?;
        Ok(())
    }

    fn scenes_for_job(&mut self, job_id: Uuid) -> StoreResult<Vec<Scene>> {
        let sql = format!(
            "SELECT {} FROM scenes WHERE job_id = ?1 ORDER BY scene_number ASC",
            SCENE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![job_id.to_string()], SceneRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SceneRow::into_scene).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn rollback_on_drop() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let mut uow = store.begin().unwrap();
            uow.insert_outbox(NewOutboxEvent::new("scene.saved", json!({"n": 1})))
                .unwrap();
        }
        let mut uow = store.begin().unwrap();
        assert!(uow.unpublished_outbox(10).unwrap().is_empty());
    }

    #[test]
    fn outbox_round_trips_through_sql() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut uow = store.begin().unwrap();
        let event = uow
            .insert_outbox(NewOutboxEvent::new("scene.saved", json!({"scene_number": 2})))
            .unwrap();
        uow.commit().unwrap();

        let mut uow = store.begin().unwrap();
        let loaded = uow.outbox_event(event.id).unwrap().unwrap();
        assert_eq!(loaded.event_type, "scene.saved");
        assert_eq!(loaded.payload, json!({"scene_number": 2}));
        assert!(!loaded.published);

        assert_eq!(uow.mark_outbox_published(&[event.id], Utc::now()).unwrap(), 1);
        assert_eq!(uow.mark_outbox_published(&[event.id], Utc::now()).unwrap(), 0);
        assert!(uow.unpublished_outbox(10).unwrap().is_empty());
    }

    #[test]
    fn insert_inbox_ignores_duplicate_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut uow = store.begin().unwrap();
        let first = uow
            .insert_inbox(
                NewInboxEvent::new("scene.saved", json!({"v": 1})).with_idempotency_key("k"),
                now,
            )
            .unwrap();
        let second = uow
            .insert_inbox(
                NewInboxEvent::new("scene.saved", json!({"v": 2})).with_idempotency_key("k"),
                now,
            )
            .unwrap();
        let unkeyed_a = uow.insert_inbox(NewInboxEvent::new("x", json!({})), now).unwrap();
        let unkeyed_b = uow.insert_inbox(NewInboxEvent::new("x", json!({})), now).unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(unkeyed_a.is_some());
        assert!(unkeyed_b.is_some());
    }

    #[test]
    fn candidates_respect_lease_and_budget() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut uow = store.begin().unwrap();
        let a = uow.insert_inbox(NewInboxEvent::new("x", json!({})), now).unwrap().unwrap();
        let b = uow.insert_inbox(NewInboxEvent::new("x", json!({})), now).unwrap().unwrap();
        let c = uow.insert_inbox(NewInboxEvent::new("x", json!({})), now).unwrap().unwrap();

        uow.lease_inbox(&[a.id], now + ChronoDuration::minutes(10), now).unwrap();
        uow.fail_inbox(b.id, "boom", now - ChronoDuration::seconds(1), now).unwrap();
        uow.fail_inbox(b.id, "boom", now - ChronoDuration::seconds(1), now).unwrap();

        let ids: Vec<Uuid> = uow
            .inbox_candidates(&CandidateQuery::new(2, now))
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![c.id]);

        let ids: Vec<Uuid> = uow
            .inbox_candidates(&CandidateQuery::new(5, now))
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![b.id, c.id]);
    }

    #[test]
    fn dead_letter_and_replay() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut uow = store.begin().unwrap();
        let row = uow.insert_inbox(NewInboxEvent::new("x", json!({})), now).unwrap().unwrap();

        assert!(uow.dead_letter_inbox(row.id, "FAILED after 1 retries: boom", now).unwrap());
        let parked = uow.dead_letters(10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].status, InboxStatus::DeadLetter);
        assert!(!uow.complete_inbox(row.id, now).unwrap());

        assert!(uow.replay_dead_letter(row.id, now).unwrap());
        let replayed = uow.inbox_event(row.id).unwrap().unwrap();
        assert!(replayed.is_pending());
        assert_eq!(replayed.retry_count, 0);
    }

    #[test]
    fn job_status_and_scenes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = ProcessingJob::new(Uuid::new_v4(), JobStatus::ReadyForReview);
        let mut uow = store.begin().unwrap();
        uow.insert_job(&job).unwrap();
        uow.insert_scene(&Scene::new(job.id, 2, "second")).unwrap();
        uow.insert_scene(&Scene::new(job.id, 1, "first scene")).unwrap();
        assert!(matches!(
            uow.insert_scene(&Scene::new(Uuid::new_v4(), 1, "orphan")),
            Err(StoreError::NotFound(_))
        ));

        let numbers: Vec<i64> = uow
            .scenes_for_job(job.id)
            .unwrap()
            .iter()
            .map(|s| s.scene_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);

        uow.set_job_status(job.id, JobStatus::Approved, Some(ProcessingStep::Finalization), Utc::now())
            .unwrap();
        let loaded = uow.job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Approved);
        assert_eq!(loaded.current_step, Some(ProcessingStep::Finalization));
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let mut uow = store.begin().unwrap();
            uow.insert_outbox(NewOutboxEvent::new("job.completed", json!({}))).unwrap();
            uow.commit().unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let mut uow = store.begin().unwrap();
        assert_eq!(uow.unpublished_outbox(10).unwrap().len(), 1);
    }
}
