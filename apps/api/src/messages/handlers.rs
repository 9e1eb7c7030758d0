//! Axum route handlers for the Messages API.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use tracing::info;

use crate::errors::AppError;
use crate::jobs::model::JobId;
use crate::messages::models::{JobStatusResponse, SubmitMessageRequest, SubmitMessageResponse};
use crate::state::AppState;

const JOB_NOT_FOUND: &str = "Job not found";

/// POST /api/messages
///
/// Validates the payload and enqueues a generation job. Returns as soon as the job is
/// stored; generation happens in the background.
pub async fn handle_submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitMessageRequest>, JsonRejection>,
) -> Result<Json<SubmitMessageResponse>, AppError> {
    let Json(request) = body.map_err(|e| AppError::Validation(e.body_text()))?;
    let payload = request.validate()?;

    let job_id = state
        .jobs
        .submit(payload)
        .await
        .map_err(|e| AppError::unavailable("Failed to process request", e))?;

    info!(%job_id, "message job submitted");
    Ok(Json(SubmitMessageResponse { job_id }))
}

/// GET /api/messages/:job_id
///
/// Point-in-time job state. Never waits for the job to finish.
pub async fn handle_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    // A malformed id cannot name any job.
    let id: JobId = job_id
        .parse()
        .map_err(|_| AppError::NotFound(JOB_NOT_FOUND.to_string()))?;

    let status = state
        .jobs
        .status(id)
        .await
        .map_err(|e| AppError::unavailable("Failed to fetch job status", e))?
        .ok_or_else(|| AppError::NotFound(JOB_NOT_FOUND.to_string()))?;

    Ok(Json(JobStatusResponse::from_status(id, status)?))
}
