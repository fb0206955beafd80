use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::ApprovalError;
use crate::event::{EventKind, JobCompleted, SceneSaved, ScenesBatchSaved};
use crate::outbox::create_kind;
use crate::store::{
    transaction, JobLog, JobStatus, ProcessingStep, Scene, Store, StoreError, StoreResult,
};

/// Result of a successful [`approve_job`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Events staged and status flipped.
    Approved { scenes: usize, events: usize },
    /// The job was approved earlier; nothing was written.
    AlreadyApproved,
}

/// Approve a reviewed job.
///
/// In one unit of work: one `scene.saved` per scene in ascending scene
/// number, one `scenes.batch_saved`, one `job.completed`, and the move to
/// `Approved` at step `Finalization`. Either every row lands or none does.
pub fn approve_job<S: Store>(store: &S, job_id: Uuid) -> Result<ApprovalOutcome, ApprovalError> {
    let outcome = transaction(store, |uow| -> Result<_, ApprovalError> {
        let job = uow.job(job_id)?.ok_or(ApprovalError::JobNotFound(job_id))?;
        match job.status {
            JobStatus::Approved => return Ok(ApprovalOutcome::AlreadyApproved),
            JobStatus::ReadyForReview => {}
            status => return Err(ApprovalError::NotReady { status }),
        }

        let scenes = uow.scenes_for_job(job_id)?;
        if scenes.is_empty() {
            return Err(ApprovalError::NoScenes);
        }

        for scene in &scenes {
            create_kind(
                uow,
                &EventKind::SceneSaved(SceneSaved {
                    scene_number: scene.scene_number,
                    document_id: job.document_id,
                    scene_text: scene.scene_text.clone(),
                    scene_id: scene.id,
                    job_id,
                    word_count: scene.word_count,
                    char_count: scene.char_count,
                }),
            )?;
        }
        create_kind(
            uow,
            &EventKind::ScenesBatchSaved(ScenesBatchSaved {
                job_id,
                document_id: job.document_id,
                scene_ids: scenes.iter().map(|s| s.id).collect(),
                total_count: scenes.len(),
            }),
        )?;
        create_kind(
            uow,
            &EventKind::JobCompleted(JobCompleted {
                job_id,
                document_id: job.document_id,
                total_scenes: scenes.len(),
            }),
        )?;

        uow.set_job_status(
            job_id,
            JobStatus::Approved,
            Some(ProcessingStep::Finalization),
            Utc::now(),
        )?;
        Ok(ApprovalOutcome::Approved {
            scenes: scenes.len(),
            events: scenes.len() + 2,
        })
    })?;

    if let ApprovalOutcome::Approved { scenes, events } = outcome {
        info!(job_id = %job_id, scenes, events, "Job approved");
    }
    Ok(outcome)
}

/// Store the scenes produced for a job and move it to review.
///
/// Scenes are numbered from 1 in the order given.
pub fn submit_scenes<S, I, T>(store: &S, job_id: Uuid, texts: I) -> StoreResult<Vec<Scene>>
where
    S: Store,
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    transaction(store, |uow| -> StoreResult<_> {
        let scenes: Vec<Scene> = texts
            .into_iter()
            .zip(1..)
            .map(|(text, n)| Scene::new(job_id, n, text))
            .collect();
        for scene in &scenes {
            uow.insert_scene(scene)?;
        }
        let moved = uow.set_job_status(
            job_id,
            JobStatus::ReadyForReview,
            Some(ProcessingStep::SceneSplitting),
            Utc::now(),
        )?;
        if !moved {
            return Err(StoreError::NotFound(format!("processing job {}", job_id)));
        }
        Ok(scenes)
    })
}
