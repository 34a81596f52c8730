use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Status of a scheduled upload job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether `self -> next` is an edge of the job lifecycle.
    ///
    /// Same-status moves are allowed for non-terminal states so a caller can
    /// persist a patch (e.g. `attempt_count`) under the same optimistic lock.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Queued)
            | (Queued, Processing)
            | (Processing, Uploading)
            | (Uploading, Completed)
            | (Queued | Processing | Uploading, Failed)
            | (Failed, Pending) => true,
            (a, b) if a == b => !a.is_terminal(),
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses held while a worker owns the job.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Uploading)
    }
}

/// Classification attached to every failure the core can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
pub enum FailureKind {
    InvalidInput,
    Conflict,
    UnrecoverableInput,
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient)
    }

    /// Render a `last_error` value: `"[Kind] summary"`.
    pub fn describe(self, summary: impl std::fmt::Display) -> String {
        format!("[{}] {}", self, summary)
    }
}

/// Where the pipeline gets the media to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    /// An already rendered video on local disk.
    File { path: PathBuf },
    /// A rendering request fulfilled outside the scheduler.
    Generation { request: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PrivacyStatus {
    #[default]
    Private,
    Unlisted,
    Public,
}

/// Destination-side metadata forwarded to the uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default)]
    pub privacy_status: PrivacyStatus,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            category_id: default_category(),
            privacy_status: PrivacyStatus::default(),
        }
    }
}

fn default_platform() -> String {
    "youtube".to_string()
}

fn default_category() -> String {
    // Science & Technology
    "28".to_string()
}

/// Job payload. Never interpreted by the scheduling core beyond handing
/// `source` to the resolver and `destination`/`extra` to the uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub source: SourceRef,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl JobPayload {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: SourceRef::File { path: path.into() },
            destination: Destination::default(),
            extra: serde_json::Value::Null,
        }
    }
}

/// A scheduled upload job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub payload: JobPayload,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `pending` job with a newly assigned id.
    pub fn new(
        title: String,
        description: String,
        tags: Vec<String>,
        scheduled_at: DateTime<Utc>,
        payload: JobPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            tags,
            status: JobStatus::Pending,
            scheduled_at,
            attempt_count: 0,
            last_error: None,
            payload,
            external_id: None,
            external_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

/// Fields written alongside a compare-and-transition.
///
/// `None` leaves the stored value untouched. `last_error: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub attempt_count: Option<i32>,
    pub last_error: Option<Option<String>>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn failure(kind: FailureKind, summary: impl std::fmt::Display) -> Self {
        Self {
            last_error: Some(Some(kind.describe(summary))),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempt_count: i32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    /// Apply the patch to an in-memory job record.
    pub fn apply(&self, job: &mut Job) {
        if let Some(count) = self.attempt_count {
            job.attempt_count = count;
        }
        if let Some(last_error) = &self.last_error {
            job.last_error = last_error.clone();
        }
        if let Some(id) = &self.external_id {
            job.external_id = Some(id.clone());
        }
        if let Some(url) = &self.external_url {
            job.external_url = Some(url.clone());
        }
        if let Some(at) = self.scheduled_at {
            job.scheduled_at = at;
        }
    }
}

/// One entry of a job's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub job_id: Uuid,
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    pub at: DateTime<Utc>,
}
