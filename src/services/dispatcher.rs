use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{FailureKind, Job, JobPatch, JobStatus};
use crate::services::pipeline::{Pipeline, PipelineOutcome};
use crate::services::retry::transition_with_retry;

type ReadyQueue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Counters shared by the pool, its workers and submit handles.
#[derive(Debug)]
struct PoolStats {
    capacity: usize,
    in_flight: AtomicUsize,
    ready: AtomicUsize,
    running: AtomicBool,
}

impl PoolStats {
    fn add_ready(&self) {
        let ready = self.ready.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("dispatcher_ready_queue_depth").set(ready as f64);
    }

    fn take_ready(&self) {
        let ready = self.ready.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("dispatcher_ready_queue_depth").set(ready as f64);
    }
}

/// Point-in-time view of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub in_flight: usize,
    pub ready: usize,
    pub running: bool,
}

/// What `Dispatcher::shutdown` did with work that never started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Ready jobs moved `queued -> failed`.
    pub released: usize,
}

/// Cloneable submit side of the ready queue.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Job>,
    stats: Arc<PoolStats>,
}

impl DispatchHandle {
    /// Enqueue a `queued` job. Never waits for a free worker.
    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        let id = job.id;
        self.stats.add_ready();
        if self.tx.send(job).is_err() {
            self.stats.take_ready();
            return Err(DispatchError::Closed(id));
        }
        Ok(())
    }
}

/// Bounded pool of workers pulling jobs from an unbounded FIFO ready queue.
pub struct Dispatcher {
    handle: DispatchHandle,
    ready: ReadyQueue,
    workers: JoinSet<()>,
    token: CancellationToken,
    store: Arc<dyn JobStore>,
}

impl Dispatcher {
    /// Start `capacity` workers. Each one owns one slot for its lifetime.
    pub fn spawn(capacity: usize, store: Arc<dyn JobStore>, pipeline: Arc<Pipeline>) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let ready: ReadyQueue = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();
        let stats = Arc::new(PoolStats {
            capacity,
            in_flight: AtomicUsize::new(0),
            ready: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });

        let mut workers = JoinSet::new();
        for slot in 0..capacity {
            let worker = Worker {
                slot,
                ready: ready.clone(),
                store: store.clone(),
                pipeline: pipeline.clone(),
                stats: stats.clone(),
                token: token.clone(),
            };
            workers.spawn(worker.run());
        }

        tracing::info!(capacity, "Worker pool started");

        Self {
            handle: DispatchHandle { tx, stats },
            ready,
            workers,
            token,
            store,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> PoolSnapshot {
        let stats = &self.handle.stats;
        PoolSnapshot {
            capacity: stats.capacity,
            in_flight: stats.in_flight.load(Ordering::SeqCst),
            ready: stats.ready.load(Ordering::SeqCst),
            running: stats.running.load(Ordering::SeqCst),
        }
    }

    /// Stop pulling new jobs, wait for in-flight stages to finish, then move
    /// jobs still waiting in the ready queue to `failed`.
    pub async fn shutdown(mut self) -> DrainReport {
        tracing::info!("Worker pool shutting down");
        self.handle.stats.running.store(false, Ordering::SeqCst);
        self.token.cancel();

        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }

        let mut report = DrainReport::default();
        let mut ready = self.ready.lock().await;
        ready.close();
        while let Ok(job) = ready.try_recv() {
            self.handle.stats.take_ready();
            let patch = JobPatch::failure(
                FailureKind::Transient,
                "scheduler shut down before the job started",
            );
            match self
                .store
                .compare_and_transition(job.id, JobStatus::Queued, JobStatus::Failed, patch)
                .await
            {
                Ok(_) => report.released += 1,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Could not release queued job")
                }
            }
        }

        tracing::info!(released = report.released, "Worker pool stopped");
        report
    }
}

struct Worker {
    slot: usize,
    ready: ReadyQueue,
    store: Arc<dyn JobStore>,
    pipeline: Arc<Pipeline>,
    stats: Arc<PoolStats>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(slot = self.slot, "Worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                job = async { self.ready.lock().await.recv().await } => job,
            };
            let Some(job) = next else { break };
            self.stats.take_ready();

            if self.token.is_cancelled() {
                self.release(job.id, "scheduler shut down before the job started")
                    .await;
                break;
            }
            self.execute(job).await;
        }
        tracing::debug!(slot = self.slot, "Worker stopped");
    }

    async fn execute(&self, job: Job) {
        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("dispatcher_in_flight").set(in_flight as f64);

        let policy = self.pipeline.retry_policy();
        match transition_with_retry(
            self.store.as_ref(),
            &policy,
            job.id,
            JobStatus::Queued,
            JobStatus::Processing,
            JobPatch::default(),
        )
        .await
        {
            Ok(job) => {
                tracing::info!(job_id = %job.id, slot = self.slot, "Worker claimed job");
                let outcome = self.pipeline.run(job, &self.token).await;
                if let PipelineOutcome::Abandoned { reason, .. } = &outcome {
                    tracing::debug!(slot = self.slot, reason = %reason, "Run abandoned");
                }
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(job_id = %job.id, error = %e, "Job no longer queued, discarding");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Could not claim job");
                self.release(job.id, format!("job could not be claimed: {}", e))
                    .await;
            }
        }

        let in_flight = self.stats.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("dispatcher_in_flight").set(in_flight as f64);
    }

    /// Move a job this worker will not run from `queued` to `failed`.
    async fn release(&self, job_id: Uuid, note: impl std::fmt::Display) {
        let policy = self.pipeline.retry_policy();
        let patch = JobPatch::failure(FailureKind::Transient, note);
        match transition_with_retry(
            self.store.as_ref(),
            &policy,
            job_id,
            JobStatus::Queued,
            JobStatus::Failed,
            patch,
        )
        .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                tracing::info!(job_id = %job_id, error = %e, "Job no longer queued, nothing to release");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not release queued job");
            }
        }
    }
}

/// Move jobs a previous scheduler process left mid-flight to `failed`.
///
/// Only valid while no other scheduler process is running.
pub async fn recover_orphans(store: &dyn JobStore) -> Result<usize, StoreError> {
    let orphans = store
        .list_by_status(&[JobStatus::Queued, JobStatus::Processing, JobStatus::Uploading])
        .await?;

    let mut recovered = 0;
    for job in orphans {
        let patch = JobPatch::failure(
            FailureKind::Transient,
            format!("scheduler restarted while job was {}", job.status),
        );
        match store
            .compare_and_transition(job.id, job.status, JobStatus::Failed, patch)
            .await
        {
            Ok(_) => {
                tracing::warn!(job_id = %job.id, status = %job.status, "Recovered orphaned job");
                recovered += 1;
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(recovered)
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Worker pool is closed, job {0} was not accepted")]
    Closed(Uuid),
}
