use chrono::{DateTime, NaiveDateTime, Utc};
use garde::Validate;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::api::CreateJobRequest;
use crate::models::job::{FailureKind, Job, JobPatch, JobStatus};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse a schedule timestamp. Values without an offset are taken as UTC.
pub fn parse_scheduled_at(raw: &str) -> Result<DateTime<Utc>, SubmitError> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| SubmitError::InvalidInput(format!("unparseable scheduled_at '{}'", raw)))
}

/// Validate a submission and persist it as a `pending` job.
pub async fn create_job(store: &dyn JobStore, request: CreateJobRequest) -> Result<Job, SubmitError> {
    if request.title.trim().is_empty() {
        return Err(SubmitError::InvalidInput("title must not be empty".to_string()));
    }
    request
        .validate()
        .map_err(|report| SubmitError::InvalidInput(report.to_string()))?;
    let scheduled_at = parse_scheduled_at(&request.scheduled_at)?;

    let job = Job::new(
        request.title.trim().to_string(),
        request.description,
        request.tags,
        scheduled_at,
        request.payload,
    );
    store.insert(job.clone()).await?;

    metrics::counter!("submission_jobs_total").increment(1);
    tracing::info!(job_id = %job.id, scheduled_at = %job.scheduled_at, "Job submitted");
    Ok(job)
}

/// Explicit re-submission of a failed job: `failed -> pending`.
///
/// Resets `attempt_count`; `last_error` is kept until the job completes.
pub async fn resubmit(
    store: &dyn JobStore,
    id: Uuid,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<Job, SubmitError> {
    let patch = JobPatch {
        attempt_count: Some(0),
        scheduled_at,
        ..JobPatch::default()
    };

    let job = store
        .compare_and_transition(id, JobStatus::Failed, JobStatus::Pending, patch)
        .await
        .map_err(|e| match e {
            StoreError::Conflict { actual, .. } => SubmitError::NotResubmittable { id, status: actual },
            other => SubmitError::Store(other),
        })?;

    tracing::info!(job_id = %id, scheduled_at = %job.scheduled_at, "Job resubmitted");
    Ok(job)
}

/// Operator cancellation of a job waiting for a worker: `queued -> failed`.
///
/// A worker that later dequeues the job loses its claim and skips it.
pub async fn cancel(store: &dyn JobStore, id: Uuid) -> Result<Job, SubmitError> {
    let patch = JobPatch::failure(FailureKind::Permanent, "cancelled by operator");
    let job = store
        .compare_and_transition(id, JobStatus::Queued, JobStatus::Failed, patch)
        .await
        .map_err(|e| match e {
            StoreError::Conflict { actual, .. } => SubmitError::NotCancellable { id, status: actual },
            other => SubmitError::Store(other),
        })?;

    metrics::counter!("submission_jobs_cancelled_total").increment(1);
    tracing::info!(job_id = %id, "Job cancelled");
    Ok(job)
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job {id} is {status}; only failed jobs can be resubmitted")]
    NotResubmittable { id: Uuid, status: JobStatus },

    #[error("Job {id} is {status}; only queued jobs can be cancelled")]
    NotCancellable { id: Uuid, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SubmitError::InvalidInput(_) => Some(FailureKind::InvalidInput),
            SubmitError::NotResubmittable { .. } | SubmitError::NotCancellable { .. } => {
                Some(FailureKind::Conflict)
            }
            SubmitError::Store(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryJobStore;
    use crate::models::job::JobPayload;
    use chrono::{Datelike, Timelike};

    fn request(title: &str, scheduled_at: &str) -> CreateJobRequest {
        CreateJobRequest {
            title: title.to_string(),
            description: "Automated upload".to_string(),
            tags: vec!["automated".to_string(), "upload".to_string()],
            scheduled_at: scheduled_at.to_string(),
            payload: JobPayload::from_file("/tmp/video.mp4"),
        }
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let at = parse_scheduled_at("2025-03-01T10:30:00+02:00").unwrap();
        assert_eq!(at.hour(), 8);
    }

    #[test]
    fn test_parse_naive_as_utc() {
        let at = parse_scheduled_at("2025-03-01 10:30").unwrap();
        assert_eq!((at.day(), at.hour(), at.minute()), (1, 10, 30));
        assert!(parse_scheduled_at("2025-03-01T10:30:15.250").is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_scheduled_at("next tuesday"),
            Err(SubmitError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_create_job_persists_pending() {
        let store = MemoryJobStore::new();
        let job = create_job(&store, request("Launch day", "2025-03-01T10:30:00Z"))
            .await
            .unwrap();

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.tags.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_title_rejected_before_persistence() {
        let store = MemoryJobStore::new();
        let err = create_job(&store, request("   ", "2025-03-01T10:30:00Z"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::InvalidInput));
        assert!(store.count_by_status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_timestamp_rejected() {
        let store = MemoryJobStore::new();
        let err = create_job(&store, request("Launch day", "soon")).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_resubmit_only_from_failed() {
        let store = MemoryJobStore::new();
        let job = create_job(&store, request("Launch day", "2025-03-01T10:30:00Z"))
            .await
            .unwrap();

        let err = resubmit(&store, job.id, None).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::NotResubmittable {
                status: JobStatus::Pending,
                ..
            }
        ));

        store
            .compare_and_transition(job.id, JobStatus::Pending, JobStatus::Queued, JobPatch::default())
            .await
            .unwrap();
        store
            .compare_and_transition(
                job.id,
                JobStatus::Queued,
                JobStatus::Failed,
                JobPatch::failure(FailureKind::Transient, "interrupted").with_attempts(2),
            )
            .await
            .unwrap();

        let later = parse_scheduled_at("2030-01-01T00:00:00Z").unwrap();
        let job = resubmit(&store, job.id, Some(later)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.scheduled_at, later);
    }

    #[tokio::test]
    async fn test_cancel_only_from_queued() {
        let store = MemoryJobStore::new();
        let job = create_job(&store, request("Launch day", "2025-03-01T10:30:00Z"))
            .await
            .unwrap();

        let err = cancel(&store, job.id).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::NotCancellable {
                status: JobStatus::Pending,
                ..
            }
        ));

        store
            .compare_and_transition(job.id, JobStatus::Pending, JobStatus::Queued, JobPatch::default())
            .await
            .unwrap();
        let job = cancel(&store, job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("[Permanent] cancelled by operator"));

        assert!(matches!(
            cancel(&store, job.id).await,
            Err(SubmitError::NotCancellable {
                status: JobStatus::Failed,
                ..
            })
        ));
    }
}
