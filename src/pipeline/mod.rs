//! Scene-splitter job workflow.
//!
//! A job's scenes are reviewed by a person before anything downstream sees
//! them. Approval announces every scene at once through the outbox.

mod approval;
mod error;

pub use approval::{approve_job, submit_scenes, ApprovalOutcome};
pub use error::ApprovalError;
