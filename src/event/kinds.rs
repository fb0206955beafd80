//! The pipeline's event catalogue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::{EventRegistry, EventRoute, SeriesKeySpec};

pub const SCENE_SAVED: &str = "scene.saved";
pub const SCENES_BATCH_SAVED: &str = "scenes.batch_saved";
pub const JOB_COMPLETED: &str = "job.completed";
pub const PROMPT_EXTRACTED: &str = "prompt.extracted";

/// One approved scene, announced to prompt extraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneSaved {
    pub scene_number: i64,
    pub document_id: Uuid,
    pub scene_text: String,
    pub scene_id: Uuid,
    pub job_id: Uuid,
    pub word_count: i64,
    pub char_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenesBatchSaved {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub scene_ids: Vec<Uuid>,
    pub total_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub total_scenes: usize,
}

/// Prompt of an earlier scene in the same story.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviousContext {
    pub story_uuid: String,
    pub scene_number: i64,
    pub prompt: String,
}

/// An image prompt extracted from one scene, announced to image generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptExtracted {
    pub story_uuid: String,
    pub scene_number: i64,
    pub prompt: String,
    pub scene_id: String,
    #[serde(default)]
    pub previous_contexts: Vec<PreviousContext>,
}

#[derive(Debug, Error)]
pub enum EventKindError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("invalid {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Closed set of events flowing through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    SceneSaved(SceneSaved),
    ScenesBatchSaved(ScenesBatchSaved),
    JobCompleted(JobCompleted),
    PromptExtracted(PromptExtracted),
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::SceneSaved(_) => SCENE_SAVED,
            EventKind::ScenesBatchSaved(_) => SCENES_BATCH_SAVED,
            EventKind::JobCompleted(_) => JOB_COMPLETED,
            EventKind::PromptExtracted(_) => PROMPT_EXTRACTED,
        }
    }

    /// The self-contained payload document.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventKind::SceneSaved(p) => serde_json::to_value(p),
            EventKind::ScenesBatchSaved(p) => serde_json::to_value(p),
            EventKind::JobCompleted(p) => serde_json::to_value(p),
            EventKind::PromptExtracted(p) => serde_json::to_value(p),
        }
    }

    /// Rebuild a typed event from its tag and payload.
    pub fn decode(event_type: &str, payload: &Value) -> Result<Self, EventKindError> {
        let wrap = |source| EventKindError::Payload {
            event_type: event_type.to_string(),
            source,
        };
        match event_type {
            SCENE_SAVED => SceneSaved::deserialize(payload)
                .map(EventKind::SceneSaved)
                .map_err(wrap),
            SCENES_BATCH_SAVED => ScenesBatchSaved::deserialize(payload)
                .map(EventKind::ScenesBatchSaved)
                .map_err(wrap),
            JOB_COMPLETED => JobCompleted::deserialize(payload)
                .map(EventKind::JobCompleted)
                .map_err(wrap),
            PROMPT_EXTRACTED => PromptExtracted::deserialize(payload)
                .map(EventKind::PromptExtracted)
                .map_err(wrap),
            other => Err(EventKindError::UnknownType(other.to_string())),
        }
    }
}

/// Routes for every event in the catalogue.
pub fn pipeline_registry() -> EventRegistry {
    EventRegistry::builder()
        .route(
            SCENE_SAVED,
            EventRoute::new("scene_saved_events", SCENE_SAVED)
                .with_series(SeriesKeySpec::new("document_id", "scene_number")),
        )
        .route(
            SCENES_BATCH_SAVED,
            EventRoute::new("scenes_batch_saved_events", SCENES_BATCH_SAVED),
        )
        .route(
            JOB_COMPLETED,
            EventRoute::new("job_completed_events", JOB_COMPLETED),
        )
        .route(
            PROMPT_EXTRACTED,
            EventRoute::new("prompt_extracted_events", PROMPT_EXTRACTED).with_series(
                SeriesKeySpec::new("story_uuid", "scene_number").with_fallback("scene_id"),
            ),
        )
        .build()
}
