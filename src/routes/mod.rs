use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::db::store::StoreError;
use crate::models::api::ErrorResponse;
use crate::services::submission::SubmitError;

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod status;

/// Error returned by API handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict { .. } | StoreError::Duplicate(_) => StatusCode::CONFLICT,
            _ => {
                tracing::error!(error = %e, "Job store error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidInput(message) => Self {
                status: StatusCode::BAD_REQUEST,
                message,
            },
            SubmitError::NotResubmittable { .. } | SubmitError::NotCancellable { .. } => Self {
                status: StatusCode::CONFLICT,
                message: e.to_string(),
            },
            SubmitError::Store(e) => e.into(),
        }
    }
}
