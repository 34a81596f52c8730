use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobPayload, JobStatus, StatusTransition};

/// Request to schedule a new upload job.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[garde(length(min = 1, max = 100))]
    pub title: String,

    #[serde(default)]
    #[garde(length(max = 5000))]
    pub description: String,

    #[serde(default)]
    #[garde(length(max = 50), inner(length(min = 1, max = 100)))]
    pub tags: Vec<String>,

    /// RFC 3339 or naive ISO-8601 (interpreted as UTC).
    #[garde(length(min = 1))]
    pub scheduled_at: String,

    #[garde(skip)]
    pub payload: JobPayload,
}

/// Optional body of a re-submission.
#[derive(Debug, Default, Deserialize)]
pub struct ResubmitRequest {
    pub scheduled_at: Option<String>,
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
}

/// Response for querying a single job.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub title: String,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            title: job.title,
            status: job.status,
            scheduled_at: job.scheduled_at,
            attempt_count: job.attempt_count,
            last_error: job.last_error,
            external_id: job.external_id,
            external_url: job.external_url,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobHistoryResponse {
    pub job_id: Uuid,
    pub transitions: Vec<StatusTransition>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
