//! Shared fixtures for scheduler tests: scripted uploader, temp videos, job builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use upload_scheduler::config::SchedulerConfig;
use upload_scheduler::db::{JobStore, MemoryJobStore, StoreError};
use upload_scheduler::models::job::{Job, JobPatch, JobPayload, JobStatus, StatusTransition};
use upload_scheduler::services::detector::Detector;
use upload_scheduler::services::dispatcher::Dispatcher;
use upload_scheduler::services::pipeline::Pipeline;
use upload_scheduler::services::retry::RetryPolicy;
use upload_scheduler::services::source::{FsSourceResolver, PreparedSource};
use upload_scheduler::services::uploader::{
    watch_url, AuthError, Credential, ProgressSink, UploadError, UploadMetadata, UploadReceipt,
    Uploader,
};

/// Outcome of one scripted upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Transient,
    Permanent,
}

/// Uploader that replays a script of outcomes and records concurrency.
///
/// Once the script is exhausted every attempt uses `fallback`.
pub struct ScriptedUploader {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    pub attempts: AtomicUsize,
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
}

impl ScriptedUploader {
    pub fn always(step: Step) -> Self {
        Self::scripted(Vec::new(), step)
    }

    pub fn scripted(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback,
            delay: Duration::ZERO,
            attempts: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Titles of the uploads the platform accepted.
    pub fn uploaded_titles(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        self.script.lock().unwrap().pop_front().unwrap_or(self.fallback)
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        Ok(Credential {
            token: "test-token".to_string(),
        })
    }

    async fn upload(
        &self,
        _credential: &Credential,
        source: &PreparedSource,
        metadata: &UploadMetadata,
        progress: &dyn ProgressSink,
    ) -> Result<UploadReceipt, UploadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self.next_step();
        self.current.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Succeed => {
                progress.report(source.size_bytes, source.size_bytes);
                self.uploaded.lock().unwrap().push(metadata.title.clone());
                let external_id = format!("vid-{}", &Uuid::new_v4().simple().to_string()[..11]);
                Ok(UploadReceipt {
                    url: watch_url(&metadata.destination.platform, &external_id),
                    external_id,
                })
            }
            Step::Transient => Err(UploadError::Transient("503 Service Unavailable".to_string())),
            Step::Permanent => Err(UploadError::Permanent("403 quotaExceeded".to_string())),
        }
    }
}

/// Write a small non-empty file standing in for a rendered video.
pub fn temp_video(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("upload-scheduler-tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}-{}", Uuid::new_v4(), name));
    std::fs::write(&path, b"\x00\x00\x00\x18ftypmp42 fake video bytes").unwrap();
    path
}

/// Pending job due `secs_ago` seconds in the past.
pub fn due_job(title: &str, path: impl Into<PathBuf>, secs_ago: i64) -> Job {
    Job::new(
        title.to_string(),
        format!("{} (automated upload)", title),
        vec!["automated".to_string()],
        Utc::now() - ChronoDuration::seconds(secs_ago),
        JobPayload::from_file(path),
    )
}

/// Pending job scheduled `secs_ahead` seconds in the future.
pub fn future_job(title: &str, path: impl Into<PathBuf>, secs_ahead: i64) -> Job {
    Job::new(
        title.to_string(),
        String::new(),
        vec![],
        Utc::now() + ChronoDuration::seconds(secs_ahead),
        JobPayload::from_file(path),
    )
}

/// Millisecond backoff so retry tests finish quickly.
pub fn fast_retry(ceiling: u32) -> RetryPolicy {
    RetryPolicy::new(ceiling, Duration::from_millis(5), Duration::from_millis(20))
}

pub fn test_config(capacity: usize, retry: RetryPolicy) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(20),
        capacity,
        batch_limit: 100,
        retry,
    }
}

/// `MemoryJobStore` whose compare-and-transition fails with a database
/// error for chosen edges, a set number of times.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryJobStore,
    faults: Mutex<HashMap<(JobStatus, JobStatus), usize>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes of `from -> to`.
    pub fn fail_edge(&self, from: JobStatus, to: JobStatus, times: usize) {
        self.faults.lock().unwrap().insert((from, to), times);
    }

    fn take_fault(&self, from: JobStatus, to: JobStatus) -> bool {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(&(from, to)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn insert(&self, job: Job) -> Result<Uuid, StoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.inner.get(id).await
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list_due(now, statuses, limit).await
    }

    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        if self.take_fault(expected, new) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner
            .compare_and_transition(id, expected, new, patch)
            .await
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        self.inner.list_by_status(statuses).await
    }

    async fn recent_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.recent_by_status(status, limit).await
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        self.inner.count_by_status().await
    }

    async fn history(&self, id: Uuid) -> Result<Vec<StatusTransition>, StoreError> {
        self.inner.history(id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Store, pool and detector wired together around a file-based resolver.
pub struct Harness<S: JobStore = MemoryJobStore> {
    pub store: Arc<S>,
    pub uploader: Arc<ScriptedUploader>,
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: Dispatcher,
    pub detector: Detector,
}

impl Harness {
    pub fn new(uploader: ScriptedUploader, config: SchedulerConfig) -> Self {
        Self::with_store(MemoryJobStore::new(), uploader, config)
    }
}

impl<S: JobStore> Harness<S> {
    pub fn with_store(store: S, uploader: ScriptedUploader, config: SchedulerConfig) -> Self {
        let store = Arc::new(store);
        let uploader = Arc::new(uploader);
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            Arc::new(FsSourceResolver),
            uploader.clone(),
            config.retry,
        ));
        let dispatcher = Dispatcher::spawn(config.capacity, store.clone(), pipeline.clone());
        let detector = Detector::new(store.clone(), dispatcher.handle(), &config);

        Self {
            store,
            uploader,
            pipeline,
            dispatcher,
            detector,
        }
    }

    pub async fn insert(&self, job: Job) -> Uuid {
        self.store.insert(job).await.unwrap()
    }
}

/// Poll until every job is terminal or `timeout` elapses.
pub async fn wait_for_terminal(store: &dyn JobStore, ids: &[Uuid], timeout: Duration) -> Vec<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            jobs.push(store.get(*id).await.unwrap());
        }
        if jobs.iter().all(|j| j.status.is_terminal()) {
            return jobs;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "jobs not terminal within {:?}: {:?}",
                timeout,
                jobs.iter().map(|j| (j.id, j.status)).collect::<Vec<_>>()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Number of times `id` entered `status` according to its history.
pub async fn times_entered(store: &dyn JobStore, id: Uuid, status: JobStatus) -> usize {
    store
        .history(id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.to_status == status)
        .count()
}

/// Sample jobs in `processing`/`uploading` until `ids` are terminal.
///
/// Returns the largest number of active jobs seen in one sample.
pub async fn max_active_until_terminal(
    store: &dyn JobStore,
    ids: &[Uuid],
    timeout: Duration,
) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut max_active = 0;
    loop {
        let active = store
            .list_by_status(&[JobStatus::Processing, JobStatus::Uploading])
            .await
            .unwrap()
            .len();
        max_active = max_active.max(active);

        let mut done = true;
        for id in ids {
            done &= store.get(*id).await.unwrap().status.is_terminal();
        }
        if done {
            return max_active;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs not terminal within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
