use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::store::{check_transition, JobStore, StoreError};
use crate::models::job::{Job, JobPatch, JobStatus, StatusTransition};

/// In-process job store with the same semantics as the PostgreSQL store.
///
/// A single write lock covers the status check and the update, which makes
/// `compare_and_transition` atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    history: Vec<StatusTransition>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_schedule_order(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Uuid, StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let id = job.id;
        state.history.push(StatusTransition {
            job_id: id,
            from_status: None,
            to_status: job.status,
            at: job.created_at,
        });
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.state
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().await;
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status) && j.is_due(now))
            .cloned()
            .collect();
        sort_schedule_order(&mut due);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        check_transition(expected, new)?;

        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }

        let now = Utc::now();
        patch.apply(job);
        job.status = new;
        job.updated_at = now;
        let updated = job.clone();

        if expected != new {
            state.history.push(StatusTransition {
                job_id: id,
                from_status: Some(expected),
                to_status: new,
                at: now,
            });
        }
        Ok(updated)
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect();
        sort_schedule_order(&mut jobs);
        Ok(jobs)
    }

    async fn recent_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let state = self.state.read().await;
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for job in state.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn history(&self, id: Uuid) -> Result<Vec<StatusTransition>, StoreError> {
        let state = self.state.read().await;
        if !state.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(state
            .history
            .iter()
            .filter(|t| t.job_id == id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
