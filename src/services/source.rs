use async_trait::async_trait;
use std::path::PathBuf;

use crate::models::job::{FailureKind, SourceRef};

/// A source artifact that exists and can be handed to the uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSource {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Resolves a job's source reference into an uploadable artifact.
#[async_trait]
pub trait SourceResolver: Send + Sync + 'static {
    async fn resolve(&self, source: &SourceRef) -> Result<PreparedSource, PrepareError>;
}

/// Resolver for videos that already exist on local disk.
#[derive(Debug, Default, Clone)]
pub struct FsSourceResolver;

#[async_trait]
impl SourceResolver for FsSourceResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<PreparedSource, PrepareError> {
        let path = match source {
            SourceRef::File { path } => path,
            SourceRef::Generation { .. } => return Err(PrepareError::Unsupported("generation")),
        };

        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrepareError::Missing(path.clone()))
            }
            Err(e) => return Err(PrepareError::Io(path.clone(), e)),
        };

        if !meta.is_file() {
            return Err(PrepareError::NotAFile(path.clone()));
        }
        if meta.len() == 0 {
            return Err(PrepareError::Empty(path.clone()));
        }

        tracing::debug!(path = %path.display(), size_bytes = meta.len(), "Source artifact resolved");

        Ok(PreparedSource {
            path: path.clone(),
            size_bytes: meta.len(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("Source file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Source file is empty: {}", .0.display())]
    Empty(PathBuf),

    #[error("Source is not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("Cannot read source {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Source kind '{0}' is not supported by this resolver")]
    Unsupported(&'static str),
}

impl PrepareError {
    /// No preparation failure is retryable.
    pub fn kind(&self) -> FailureKind {
        match self {
            PrepareError::Unsupported(_) => FailureKind::Permanent,
            _ => FailureKind::UnrecoverableInput,
        }
    }
}
