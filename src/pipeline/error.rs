use thiserror::Error;
use uuid::Uuid;

use crate::store::{JobStatus, StoreError};

/// Why a job could not be approved. No outbox rows are written in any case.
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("job is {status}, expected ready-for-review")]
    NotReady { status: JobStatus },

    #[error("job has no scenes to publish")]
    NoScenes,

    #[error(transparent)]
    Store(#[from] StoreError),
}
