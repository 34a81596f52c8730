use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::db::store::{JobStore, StoreError};
use crate::models::job::{FailureKind, JobPatch, JobStatus};
use crate::services::dispatcher::DispatchHandle;

/// Result of one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pending jobs found due.
    pub due: usize,
    /// Jobs moved to `queued` and handed to the pool.
    pub promoted: usize,
    /// Jobs another actor claimed first.
    pub skipped: usize,
    /// Jobs left untouched because of a storage error.
    pub errors: usize,
}

/// Polls the store for due `pending` jobs and promotes them to `queued`.
///
/// Promotion goes through compare-and-transition, so a job is handed to the
/// pool at most once even when ticks overlap.
pub struct Detector {
    store: Arc<dyn JobStore>,
    dispatch: DispatchHandle,
    interval: Duration,
    batch_limit: i64,
}

impl Detector {
    pub fn new(store: Arc<dyn JobStore>, dispatch: DispatchHandle, config: &SchedulerConfig) -> Self {
        Self {
            store,
            dispatch,
            interval: config.poll_interval,
            batch_limit: config.batch_limit,
        }
    }

    /// Tick, sleep for the interval, repeat until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            batch_limit = self.batch_limit,
            "Detector started"
        );

        loop {
            match self.tick().await {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        due = report.due,
                        promoted = report.promoted,
                        skipped = report.skipped,
                        errors = report.errors,
                        "Detector tick"
                    );
                }
                Ok(_) => tracing::trace!("No due jobs"),
                Err(e) => tracing::error!(error = %e, "Detector tick failed, retrying next interval"),
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Detector stopped");
    }

    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        self.tick_at(Utc::now()).await
    }

    /// One polling pass as of `now`. Due jobs are promoted in `scheduled_at` order.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let due = self
            .store
            .list_due(now, &[JobStatus::Pending], self.batch_limit)
            .await?;

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for candidate in due {
            let queued = match self
                .store
                .compare_and_transition(
                    candidate.id,
                    JobStatus::Pending,
                    JobStatus::Queued,
                    JobPatch::default(),
                )
                .await
            {
                Ok(job) => job,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(job_id = %candidate.id, "Job already claimed, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = %candidate.id, error = %e, "Could not promote job");
                    report.errors += 1;
                    continue;
                }
            };

            let job_id = queued.id;
            match self.dispatch.submit(queued) {
                Ok(()) => {
                    metrics::counter!("detector_jobs_promoted_total").increment(1);
                    tracing::debug!(job_id = %job_id, "Job promoted to queued");
                    report.promoted += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Promoted job rejected by worker pool");
                    let patch = JobPatch::failure(FailureKind::Transient, &e);
                    if let Err(e) = self
                        .store
                        .compare_and_transition(job_id, JobStatus::Queued, JobStatus::Failed, patch)
                        .await
                    {
                        tracing::error!(job_id = %job_id, error = %e, "Could not release rejected job");
                    }
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}
