use std::sync::Arc;
use std::time::Instant;
use strum::Display;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{FailureKind, Job, JobPatch, JobStatus};
use crate::services::retry::{transition_with_retry, RetryDecision, RetryPolicy, RetryState};
use crate::services::source::{PreparedSource, SourceResolver};
use crate::services::uploader::{LogProgress, UploadMetadata, UploadReceipt, Uploader};

/// Stages of one job run. `processing` covers Preparing, `uploading`
/// covers Uploading and Finalizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    Preparing,
    Uploading,
    Finalizing,
    Done,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed(UploadReceipt),
    /// Job recorded as `failed`.
    Failed {
        stage: Stage,
        kind: FailureKind,
        attempt_count: i32,
    },
    /// Shutdown stopped the run between stages; job recorded as `failed`.
    Interrupted { stage: Stage, attempt_count: i32 },
    /// Another actor changed the job first, or the store stayed
    /// unreachable while recording a failure. Nothing was written.
    Abandoned { stage: Stage, reason: String },
}

/// Classified failure of one stage attempt.
#[derive(Debug, Clone)]
struct StageError {
    kind: FailureKind,
    message: String,
}

/// Per-job state machine: Preparing -> Uploading -> Finalizing -> Done.
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn SourceResolver>,
    uploader: Arc<dyn Uploader>,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn SourceResolver>,
        uploader: Arc<dyn Uploader>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            resolver,
            uploader,
            retry,
        }
    }

    /// Run a job the caller has already moved to `processing`.
    ///
    /// `token` is checked between stages and interrupts upload backoff; it
    /// never pre-empts a stage that is executing.
    pub async fn run(&self, job: Job, token: &CancellationToken) -> PipelineOutcome {
        let started = Instant::now();
        let job_id = job.id;
        tracing::info!(job_id = %job_id, title = %job.title, "Pipeline started");

        let outcome = self.execute(job, token).await;

        metrics::histogram!("pipeline_job_seconds").record(started.elapsed().as_secs_f64());
        match &outcome {
            PipelineOutcome::Completed(receipt) => {
                metrics::counter!("pipeline_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %job_id,
                    external_id = %receipt.external_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Pipeline completed"
                );
            }
            PipelineOutcome::Failed { stage, kind, .. } => {
                metrics::counter!(
                    "pipeline_jobs_failed_total",
                    "kind" => kind.to_string(),
                    "stage" => stage.to_string()
                )
                .increment(1);
            }
            PipelineOutcome::Interrupted { stage, .. } => {
                metrics::counter!(
                    "pipeline_jobs_failed_total",
                    "kind" => FailureKind::Transient.to_string(),
                    "stage" => stage.to_string()
                )
                .increment(1);
            }
            PipelineOutcome::Abandoned { .. } => {
                metrics::counter!("pipeline_jobs_abandoned_total").increment(1);
            }
        }
        outcome
    }

    async fn execute(&self, job: Job, token: &CancellationToken) -> PipelineOutcome {
        // Preparing
        let source = match self.resolver.resolve(&job.payload.source).await {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Source preparation failed");
                let err = StageError {
                    kind: e.kind(),
                    message: e.to_string(),
                };
                return self
                    .fail(job.id, JobStatus::Processing, Stage::Preparing, err, job.attempt_count)
                    .await;
            }
        };

        if token.is_cancelled() {
            return self
                .interrupt(
                    job.id,
                    JobStatus::Processing,
                    Stage::Preparing,
                    "shutdown before upload started".to_string(),
                    job.attempt_count,
                )
                .await;
        }

        // Uploading
        let job = match self
            .write(job.id, JobStatus::Processing, JobStatus::Uploading, JobPatch::default())
            .await
        {
            Ok(job) => job,
            Err(e) => {
                return self
                    .storage_failure(
                        job.id,
                        JobStatus::Processing,
                        Stage::Uploading,
                        e,
                        job.attempt_count,
                        None,
                    )
                    .await
            }
        };

        let (receipt, attempts) = match self.upload_with_retry(&job, &source, token).await {
            Ok(uploaded) => uploaded,
            Err(outcome) => return outcome,
        };

        // Finalizing always runs once the platform accepted the upload.
        match self.finalize(job.id, &receipt).await {
            Ok(_) => PipelineOutcome::Completed(receipt),
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    external_id = %receipt.external_id,
                    error = %e,
                    "Upload succeeded but completion could not be recorded"
                );
                self.storage_failure(
                    job.id,
                    JobStatus::Uploading,
                    Stage::Finalizing,
                    e,
                    attempts,
                    Some(&receipt),
                )
                .await
            }
        }
    }

    async fn upload_with_retry(
        &self,
        job: &Job,
        source: &PreparedSource,
        token: &CancellationToken,
    ) -> Result<(UploadReceipt, i32), PipelineOutcome> {
        let metadata = UploadMetadata::from_job(job);
        let progress = LogProgress::new(job.id);
        let mut retry = RetryState::new(self.retry, job.attempt_count.max(0) as u32);

        loop {
            let err = match self.attempt_upload(source, &metadata, &progress).await {
                Ok(receipt) => return Ok((receipt, retry.attempt_count() as i32)),
                Err(err) => err,
            };

            let decision = retry.record_failure(err.kind);
            let attempts = retry.attempt_count() as i32;

            match decision {
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = attempts,
                        kind = %err.kind,
                        error = %err.message,
                        "Upload failed, giving up"
                    );
                    return Err(self
                        .fail(job.id, JobStatus::Uploading, Stage::Uploading, err, attempts)
                        .await);
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "Upload failed, retrying after backoff"
                    );
                    metrics::counter!("pipeline_upload_retries_total").increment(1);

                    let patch = JobPatch::failure(err.kind, &err.message).with_attempts(attempts);
                    if let Err(e) = self
                        .write(job.id, JobStatus::Uploading, JobStatus::Uploading, patch)
                        .await
                    {
                        return Err(self
                            .storage_failure(
                                job.id,
                                JobStatus::Uploading,
                                Stage::Uploading,
                                e,
                                attempts,
                                None,
                            )
                            .await);
                    }

                    if !retry.wait_until_eligible(token).await {
                        let note = format!(
                            "shutdown during upload backoff after {} attempt(s): {}",
                            attempts, err.message
                        );
                        return Err(self
                            .interrupt(job.id, JobStatus::Uploading, Stage::Uploading, note, attempts)
                            .await);
                    }
                }
            }
        }
    }

    async fn attempt_upload(
        &self,
        source: &PreparedSource,
        metadata: &UploadMetadata,
        progress: &LogProgress,
    ) -> Result<UploadReceipt, StageError> {
        let credential = self.uploader.authenticate().await.map_err(|e| StageError {
            kind: e.kind(),
            message: e.to_string(),
        })?;

        self.uploader
            .upload(&credential, source, metadata, progress)
            .await
            .map_err(|e| StageError {
                kind: e.kind(),
                message: e.to_string(),
            })
    }

    /// Terminal `uploading -> completed` transition storing the external
    /// reference and clearing `last_error`. Storage errors are retried.
    ///
    /// A second call on an already completed job fails with `Conflict` and
    /// changes nothing.
    pub async fn finalize(&self, job_id: Uuid, receipt: &UploadReceipt) -> Result<Job, StoreError> {
        let patch = JobPatch {
            last_error: Some(None),
            external_id: Some(receipt.external_id.clone()),
            external_url: receipt.url.clone(),
            ..JobPatch::default()
        };
        self.write(job_id, JobStatus::Uploading, JobStatus::Completed, patch)
            .await
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn write(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        transition_with_retry(self.store.as_ref(), &self.retry, job_id, expected, new, patch).await
    }

    /// A state write failed for good. Unless another actor won the race,
    /// record the job as `failed` so it never stays active without a worker.
    async fn storage_failure(
        &self,
        job_id: Uuid,
        current: JobStatus,
        stage: Stage,
        err: StoreError,
        attempt_count: i32,
        receipt: Option<&UploadReceipt>,
    ) -> PipelineOutcome {
        if err.is_conflict() {
            return abandon(job_id, stage, err);
        }

        let summary = match receipt {
            Some(receipt) => format!(
                "upload published as {} but completion could not be recorded: {}",
                receipt.external_id, err
            ),
            None => format!("job state could not be recorded: {}", err),
        };
        let mut patch =
            JobPatch::failure(FailureKind::Transient, summary).with_attempts(attempt_count);
        if let Some(receipt) = receipt {
            patch.external_id = Some(receipt.external_id.clone());
            patch.external_url = receipt.url.clone();
        }

        match self.write(job_id, current, JobStatus::Failed, patch).await {
            Ok(_) => {
                tracing::warn!(job_id = %job_id, stage = %stage, error = %err, "Job failed on storage error");
                PipelineOutcome::Failed {
                    stage,
                    kind: FailureKind::Transient,
                    attempt_count,
                }
            }
            Err(e) => abandon(job_id, stage, e),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        from: JobStatus,
        stage: Stage,
        err: StageError,
        attempt_count: i32,
    ) -> PipelineOutcome {
        match self.record_failure(job_id, from, &err, attempt_count).await {
            Ok(()) => PipelineOutcome::Failed {
                stage,
                kind: err.kind,
                attempt_count,
            },
            Err(e) => abandon(job_id, stage, e),
        }
    }

    async fn interrupt(
        &self,
        job_id: Uuid,
        from: JobStatus,
        stage: Stage,
        note: String,
        attempt_count: i32,
    ) -> PipelineOutcome {
        let err = StageError {
            kind: FailureKind::Transient,
            message: note,
        };
        match self.record_failure(job_id, from, &err, attempt_count).await {
            Ok(()) => {
                tracing::info!(job_id = %job_id, stage = %stage, "Job interrupted by shutdown");
                PipelineOutcome::Interrupted {
                    stage,
                    attempt_count,
                }
            }
            Err(e) => abandon(job_id, stage, e),
        }
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        from: JobStatus,
        err: &StageError,
        attempt_count: i32,
    ) -> Result<(), StoreError> {
        let patch = JobPatch::failure(err.kind, &err.message).with_attempts(attempt_count);
        self.write(job_id, from, JobStatus::Failed, patch).await?;
        tracing::warn!(
            job_id = %job_id,
            kind = %err.kind,
            attempt_count,
            error = %err.message,
            "Job marked failed"
        );
        Ok(())
    }
}

fn abandon(job_id: Uuid, stage: Stage, err: StoreError) -> PipelineOutcome {
    if err.is_conflict() {
        tracing::info!(job_id = %job_id, stage = %stage, error = %err, "Job changed by another actor, abandoning run");
    } else {
        tracing::error!(job_id = %job_id, stage = %stage, error = %err, "Could not persist job state");
    }
    PipelineOutcome::Abandoned {
        stage,
        reason: err.to_string(),
    }
}
