//! Job approval: many outbox rows and a status change in one unit of work.

#[path = "../support/mod.rs"]
mod support;

use pipeline_relay::store::{JobLog, JobStatus, OutboxLog, ProcessingStep};
use pipeline_relay::{
    approve_job, submit_scenes, ApprovalError, ApprovalOutcome, EventKind, HashMapStore,
    SqliteStore, Store,
};

use support::job;

fn double_approval_is_a_no_op<S: Store>(store: S) {
    let id = job(&store, JobStatus::Splitting);
    submit_scenes(&store, id, ["The door opened.", "She stepped inside.", "Silence."]).unwrap();

    assert_eq!(
        approve_job(&store, id).unwrap(),
        ApprovalOutcome::Approved { scenes: 3, events: 5 }
    );
    let staged = store.begin().unwrap().unpublished_outbox(100).unwrap();
    assert_eq!(staged.len(), 5);

    assert_eq!(approve_job(&store, id).unwrap(), ApprovalOutcome::AlreadyApproved);
    assert_eq!(store.begin().unwrap().unpublished_outbox(100).unwrap().len(), 5);

    let job = store.begin().unwrap().job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Approved);
    assert_eq!(job.current_step, Some(ProcessingStep::Finalization));

    let kinds: Vec<EventKind> = staged
        .iter()
        .map(|e| EventKind::decode(&e.event_type, &e.payload).unwrap())
        .collect();
    let numbers: Vec<i64> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::SceneSaved(scene) => Some(scene.scene_number),
            _ => None,
        })
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    match &kinds[3] {
        EventKind::ScenesBatchSaved(batch) => {
            assert_eq!(batch.total_count, 3);
            assert_eq!(batch.scene_ids.len(), 3);
            assert_eq!(batch.job_id, id);
        }
        other => panic!("expected batch event, got {:?}", other),
    }
    match &kinds[4] {
        EventKind::JobCompleted(done) => assert_eq!(done.total_scenes, 3),
        other => panic!("expected completion event, got {:?}", other),
    }
}

#[test]
fn memory_store_double_approval() {
    double_approval_is_a_no_op(HashMapStore::new());
}

#[test]
fn sqlite_store_double_approval() {
    double_approval_is_a_no_op(SqliteStore::open_in_memory().unwrap());
}

fn refusals_leave_no_trace<S: Store>(store: S) {
    let pending = job(&store, JobStatus::Pending);
    assert!(matches!(
        approve_job(&store, pending),
        Err(ApprovalError::NotReady {
            status: JobStatus::Pending
        })
    ));

    let empty = job(&store, JobStatus::ReadyForReview);
    assert!(matches!(approve_job(&store, empty), Err(ApprovalError::NoScenes)));

    let failed = job(&store, JobStatus::Failed);
    assert!(approve_job(&store, failed).is_err());

    assert!(store.begin().unwrap().unpublished_outbox(100).unwrap().is_empty());
    let job = store.begin().unwrap().job(empty).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::ReadyForReview);
}

#[test]
fn memory_store_refusals() {
    refusals_leave_no_trace(HashMapStore::new());
}

#[test]
fn sqlite_store_refusals() {
    refusals_leave_no_trace(SqliteStore::open_in_memory().unwrap());
}
