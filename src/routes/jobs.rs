use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    CreateJobRequest, CreateJobResponse, JobHistoryResponse, JobStatusResponse, ResubmitRequest,
};
use crate::routes::ApiError;
use crate::services::submission::{self, parse_scheduled_at};

/// POST /api/v1/jobs: schedule a new upload job.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let job = submission::create_job(state.store.as_ref(), request).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
            scheduled_at: job.scheduled_at,
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: job status, attempts, last error and external reference.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.store.get(job_id).await?;
    Ok(Json(job.into()))
}

/// GET /api/v1/jobs/{job_id}/history
pub async fn get_job_history(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobHistoryResponse>, ApiError> {
    let transitions = state.store.history(job_id).await?;
    Ok(Json(JobHistoryResponse {
        job_id,
        transitions,
    }))
}

/// POST /api/v1/jobs/{job_id}/resubmit: put a failed job back to pending.
pub async fn resubmit_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    body: Option<Json<ResubmitRequest>>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let scheduled_at = request
        .scheduled_at
        .as_deref()
        .map(parse_scheduled_at)
        .transpose()?;

    let job = submission::resubmit(state.store.as_ref(), job_id, scheduled_at).await?;
    Ok(Json(job.into()))
}

/// POST /api/v1/jobs/{job_id}/cancel: fail a queued job before a worker claims it.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = submission::cancel(state.store.as_ref(), job_id).await?;
    Ok(Json(job.into()))
}
