use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Durable business event waiting to be published.
///
/// Written in the same unit of work as the state change it announces and
/// immutable afterwards, apart from the publish bookkeeping fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert form of [`OutboxEvent`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: Value,
}

impl NewOutboxEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    pub(crate) fn into_event(self, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            payload: self.payload,
            published: false,
            published_at: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
        }
    }
}

/// Processing state of an inbox row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    #[default]
    Pending,
    Processed,
    DeadLetter,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Processed => "processed",
            InboxStatus::DeadLetter => "dead_letter",
        }
    }

    /// Whether the row has left the pending state for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InboxStatus::Pending)
    }

    /// Precedence when several rows share a series position.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            InboxStatus::Pending => 0,
            InboxStatus::DeadLetter => 1,
            InboxStatus::Processed => 2,
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InboxStatus::Pending),
            "processed" => Ok(InboxStatus::Processed),
            "dead_letter" => Ok(InboxStatus::DeadLetter),
            other => Err(format!("unknown inbox status: {}", other)),
        }
    }
}

/// Received event landed before handling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub status: InboxStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub sequence_number: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboxEvent {
    pub fn is_pending(&self) -> bool {
        self.status == InboxStatus::Pending
    }

    pub fn is_processed(&self) -> bool {
        self.status == InboxStatus::Processed
    }

    pub fn is_dead_letter(&self) -> bool {
        self.status == InboxStatus::DeadLetter
    }

    /// Ordering key, present only when both halves are set.
    pub fn series(&self) -> Option<(&str, i64)> {
        match (self.correlation_id.as_deref(), self.sequence_number) {
            (Some(correlation), Some(sequence)) if !correlation.is_empty() => {
                Some((correlation, sequence))
            }
            _ => None,
        }
    }

    /// Whether a lease is currently held at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Insert form of [`InboxEvent`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewInboxEvent {
    pub event_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub sequence_number: Option<i64>,
    pub received_at: Option<DateTime<Utc>>,
}

impl NewInboxEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_series(mut self, correlation_id: impl Into<String>, sequence_number: i64) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub(crate) fn into_event(self, now: DateTime<Utc>) -> InboxEvent {
        InboxEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            payload: self.payload,
            idempotency_key: self.idempotency_key,
            status: InboxStatus::Pending,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            locked_until: None,
            correlation_id: self.correlation_id,
            sequence_number: self.sequence_number,
            received_at: self.received_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Order in which inbox candidates are returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CandidateOrder {
    /// `created_at`, then insertion order.
    #[default]
    Arrival,
    /// `(correlation_id, sequence_number, created_at)`, then insertion order.
    Series,
}

/// Filter for rows the processor may claim.
///
/// Matches pending rows with `retry_count < max_retries` whose lease is
/// absent or expired at `now`.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateQuery {
    pub max_retries: u32,
    pub now: DateTime<Utc>,
    pub limit: Option<usize>,
    pub order: CandidateOrder,
}

impl CandidateQuery {
    pub fn new(max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            max_retries,
            now,
            limit: None,
            order: CandidateOrder::Arrival,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_order(mut self, order: CandidateOrder) -> Self {
        self.order = order;
        self
    }

    pub(crate) fn matches(&self, event: &InboxEvent) -> bool {
        event.is_pending() && event.retry_count < self.max_retries && !event.is_leased(self.now)
    }
}

/// Lifecycle of a document processing job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Extracting,
    Splitting,
    ReadyForReview,
    Approved,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Extracting => "extracting",
            JobStatus::Splitting => "splitting",
            JobStatus::ReadyForReview => "ready-for-review",
            JobStatus::Approved => "approved",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "extracting" => Ok(JobStatus::Extracting),
            "splitting" => Ok(JobStatus::Splitting),
            "ready-for-review" => Ok(JobStatus::ReadyForReview),
            "approved" => Ok(JobStatus::Approved),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    Upload,
    TextExtraction,
    SceneSplitting,
    Finalization,
}

impl ProcessingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStep::Upload => "upload",
            ProcessingStep::TextExtraction => "text_extraction",
            ProcessingStep::SceneSplitting => "scene_splitting",
            ProcessingStep::Finalization => "finalization",
        }
    }
}

impl FromStr for ProcessingStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(ProcessingStep::Upload),
            "text_extraction" => Ok(ProcessingStep::TextExtraction),
            "scene_splitting" => Ok(ProcessingStep::SceneSplitting),
            "finalization" => Ok(ProcessingStep::Finalization),
            other => Err(format!("unknown processing step: {}", other)),
        }
    }
}

/// A segmentation job over one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub status: JobStatus,
    pub current_step: Option<ProcessingStep>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    pub fn new(document_id: Uuid, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            status,
            current_step: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// One segment produced by a processing job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: Uuid,
    pub job_id: Uuid,
    pub scene_number: i64,
    pub scene_text: String,
    pub word_count: i64,
    pub char_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Scene {
    /// Build a scene, deriving word and character counts from the text.
    pub fn new(job_id: Uuid, scene_number: i64, scene_text: impl Into<String>) -> Self {
        let scene_text = scene_text.into();
        Self {
            id: Uuid::new_v4(),
            job_id,
            scene_number,
            word_count: scene_text.split_whitespace().count() as i64,
            char_count: scene_text.chars().count() as i64,
            scene_text,
            created_at: Utc::now(),
        }
    }
}
