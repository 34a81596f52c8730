use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{Job, JobStatus};

/// Job currently held by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub job_id: Uuid,
    pub title: String,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for ActiveJob {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            title: job.title,
            status: job.status,
            scheduled_at: job.scheduled_at,
            attempt_count: job.attempt_count,
            updated_at: job.updated_at,
        }
    }
}

/// Diagnosis view of a failed job.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub job_id: Uuid,
    pub title: String,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl From<Job> for FailedJob {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            title: job.title,
            attempt_count: job.attempt_count,
            last_error: job.last_error,
            failed_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub counts: BTreeMap<JobStatus, i64>,
    pub active: Vec<ActiveJob>,
    pub recent_failures: Vec<FailedJob>,
    pub generated_at: DateTime<Utc>,
}

/// Read-only projection over the job store.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn JobStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Job count per status; every status is present.
    pub async fn counts(&self) -> Result<BTreeMap<JobStatus, i64>, StoreError> {
        let mut counts: BTreeMap<JobStatus, i64> = JobStatus::iter().map(|s| (s, 0)).collect();
        for (status, n) in self.store.count_by_status().await? {
            counts.insert(status, n);
        }
        Ok(counts)
    }

    /// Jobs in `processing` or `uploading`, by `scheduled_at` then id.
    pub async fn active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.store
            .list_by_status(&[JobStatus::Processing, JobStatus::Uploading])
            .await
    }

    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.store.recent_by_status(JobStatus::Failed, limit).await
    }

    pub async fn snapshot(&self, failure_limit: i64) -> Result<StatusSnapshot, StoreError> {
        let counts = self.counts().await?;
        let active = self.active_jobs().await?;
        let failures = self.recent_failures(failure_limit).await?;

        Ok(StatusSnapshot {
            counts,
            active: active.into_iter().map(ActiveJob::from).collect(),
            recent_failures: failures.into_iter().map(FailedJob::from).collect(),
            generated_at: Utc::now(),
        })
    }
}
