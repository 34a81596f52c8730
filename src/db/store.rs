use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{Job, JobPatch, JobStatus, StatusTransition};

/// Durable record of job state.
///
/// `compare_and_transition` is the only way a stored job changes after
/// `insert`. It is atomic and applies only when the stored status equals
/// `expected`, which is what keeps two callers from claiming the same job.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job and return its id.
    async fn insert(&self, job: Job) -> Result<Uuid, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Jobs with `scheduled_at <= now` in one of `statuses`, ordered by
    /// `scheduled_at` then `id`, at most `limit` rows.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError>;

    /// Jobs in any of `statuses` regardless of due time, same ordering as `list_due`.
    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError>;

    /// Most recently updated jobs in `status`, newest first.
    async fn recent_by_status(&self, status: JobStatus, limit: i64)
        -> Result<Vec<Job>, StoreError>;

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError>;

    /// Status history of a job, oldest first.
    async fn history(&self, id: Uuid) -> Result<Vec<StatusTransition>, StoreError>;

    /// Connectivity check for health endpoints.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Reject transitions that are not lifecycle edges before touching storage.
pub fn check_transition(expected: JobStatus, new: JobStatus) -> Result<(), StoreError> {
    if expected.can_transition_to(new) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            from: expected,
            to: new,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Duplicate job id: {0}")]
    Duplicate(Uuid),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Storage failures that may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}
