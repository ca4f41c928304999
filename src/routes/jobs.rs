use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::app_state::AppState;
use crate::models::api::{ExternalStatus, SubmitJobRequest, SubmitJobResponse};
use crate::models::job::JobId;
use crate::services::dispatcher::DispatchError;
use crate::services::status::StatusError;

/// POST /api/v1/jobs — Queue a batch of items for checking.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let response = state.dispatcher.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/v1/jobs/{job_id} — Poll a job's status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ExternalStatus>, ApiError> {
    // A malformed id can never name a job.
    let job_id = JobId::parse(&job_id).ok_or(ApiError::NotFound)?;
    let status = state.projector.status(job_id).await?;
    Ok(Json(status))
}

/// Errors surfaced to HTTP clients.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Conflict(String),
    NotFound,
    Internal,
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(report) => ApiError::Validation(report.to_string()),
            DispatchError::Duplicate(id) => ApiError::Conflict(format!("job {} already exists", id)),
            DispatchError::Store(e) => {
                tracing::error!(error = %e, "Failed to queue job");
                ApiError::Internal
            }
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound(_) => ApiError::NotFound,
            StatusError::Store(e) => {
                tracing::error!(error = %e, "Failed to read job status");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "job not found".to_string()),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
