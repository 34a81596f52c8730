use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::routes::ApiError;
use crate::services::reporter::StatusSnapshot;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default = "default_failure_limit")]
    pub failures: i64,
}

fn default_failure_limit() -> i64 {
    20
}

/// GET /api/v1/status: counts per status, active jobs and recent failures.
pub async fn get_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    let limit = query.failures.clamp(0, 200);
    let snapshot = state.reporter.snapshot(limit).await?;
    Ok(Json(snapshot))
}
