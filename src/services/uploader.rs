use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::multipart;
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::models::job::{Destination, FailureKind, Job};
use crate::services::source::PreparedSource;

/// Credential returned by `Uploader::authenticate`.
#[derive(Clone)]
pub struct Credential {
    pub token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("token", &"<redacted>").finish()
    }
}

/// Metadata published alongside the media.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub destination: Destination,
    pub extra: serde_json::Value,
}

impl UploadMetadata {
    pub fn from_job(job: &Job) -> Self {
        Self {
            title: job.title.clone(),
            description: job.description.clone(),
            tags: job.tags.clone(),
            destination: job.payload.destination.clone(),
            extra: job.payload.extra.clone(),
        }
    }
}

/// External reference of a published video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub external_id: String,
    pub url: Option<String>,
}

/// Receives byte-level upload progress.
pub trait ProgressSink: Send + Sync {
    fn report(&self, sent: u64, total: u64);
}

/// Logs upload progress in 10% steps.
pub struct LogProgress {
    job_id: Uuid,
    last_step: AtomicU64,
}

impl LogProgress {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            last_step: AtomicU64::new(0),
        }
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, sent: u64, total: u64) {
        if total == 0 {
            return;
        }
        let step = sent.min(total) * 10 / total;
        if step > self.last_step.fetch_max(step, Ordering::Relaxed) {
            tracing::info!(job_id = %self.job_id, percent = step * 10, "Upload progress");
        }
    }
}

/// Platform upload client consumed by the pipeline.
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    async fn authenticate(&self) -> Result<Credential, AuthError>;

    async fn upload(
        &self,
        credential: &Credential,
        source: &PreparedSource,
        metadata: &UploadMetadata,
        progress: &dyn ProgressSink,
    ) -> Result<UploadReceipt, UploadError>;
}

/// Watch URL for platforms whose URL can be derived from the video id.
pub fn watch_url(platform: &str, external_id: &str) -> Option<String> {
    match platform {
        "youtube" => Some(format!("https://www.youtube.com/watch?v={}", external_id)),
        _ => None,
    }
}

/// Uploader posting multipart requests to an HTTP publishing endpoint.
pub struct HttpUploader {
    http: Client,
    endpoint: String,
    api_token: String,
}

#[derive(Deserialize)]
struct PublishResponse {
    id: String,
    url: Option<String>,
}

impl HttpUploader {
    pub fn new(endpoint: &str, api_token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        if self.endpoint.trim().is_empty() {
            return Err(AuthError::Rejected("no upload endpoint configured".to_string()));
        }
        if self.api_token.trim().is_empty() {
            return Err(AuthError::Rejected("no upload API token configured".to_string()));
        }
        Ok(Credential {
            token: self.api_token.clone(),
        })
    }

    async fn upload(
        &self,
        credential: &Credential,
        source: &PreparedSource,
        metadata: &UploadMetadata,
        progress: &dyn ProgressSink,
    ) -> Result<UploadReceipt, UploadError> {
        let file = tokio::fs::File::open(&source.path).await.map_err(|e| {
            UploadError::Permanent(format!("cannot read {}: {}", source.path.display(), e))
        })?;
        let total = file
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or(source.size_bytes);
        progress.report(0, total);

        let file_name = source
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("video.mp4")
            .to_string();

        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| UploadError::Permanent(format!("cannot encode metadata: {}", e)))?;

        // The body stream must be 'static, so byte counts travel over a channel.
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<u64>();
        let mut sent = 0u64;
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
            sent += chunk.len() as u64;
            let _ = sent_tx.send(sent);
        });

        let media = multipart::Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(file_name)
            .mime_str("video/mp4")
            .map_err(|e| UploadError::Permanent(e.to_string()))?;

        let form = multipart::Form::new()
            .text("metadata", metadata_json)
            .part("media", media);

        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&credential.token)
            .multipart(form)
            .send();
        tokio::pin!(request);

        let response = loop {
            tokio::select! {
                result = &mut request => break result.map_err(classify_request_error)?,
                Some(sent) = sent_rx.recv() => progress.report(sent, total),
            }
        };
        while let Ok(sent) = sent_rx.try_recv() {
            progress.report(sent, total);
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let published: PublishResponse = response
            .json()
            .await
            .map_err(|e| UploadError::Permanent(format!("unreadable publish response: {}", e)))?;
        progress.report(total, total);

        let url = published
            .url
            .or_else(|| watch_url(&metadata.destination.platform, &published.id));

        Ok(UploadReceipt {
            external_id: published.id,
            url,
        })
    }
}

fn classify_request_error(e: reqwest::Error) -> UploadError {
    if e.is_builder() || e.is_decode() {
        UploadError::Permanent(e.to_string())
    } else {
        // connect, timeout, body and protocol errors
        UploadError::Transient(e.to_string())
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> UploadError {
    let message = if body.is_empty() {
        format!("upload rejected with status {}", status)
    } else {
        format!("upload rejected with status {}: {}", status, body)
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        UploadError::Transient(message)
    } else {
        UploadError::Permanent(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication service unavailable: {0}")]
    Unavailable(String),

    #[error("Authentication rejected: {0}")]
    Rejected(String),
}

impl AuthError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AuthError::Unavailable(_) => FailureKind::Transient,
            AuthError::Rejected(_) => FailureKind::Permanent,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Transient upload failure: {0}")]
    Transient(String),

    #[error("Upload failed: {0}")]
    Permanent(String),
}

impl UploadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            UploadError::Transient(_) => FailureKind::Transient,
            UploadError::Permanent(_) => FailureKind::Permanent,
        }
    }
}
