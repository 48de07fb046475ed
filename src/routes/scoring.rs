use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{CreateScoringJobRequest, CreateScoringJobResponse, JobStatusResponse};
use crate::routes::error::ApiError;

/// POST /api/score-jobs: queue a finalized submission for scoring.
pub async fn create_scoring_job(
    State(state): State<AppState>,
    Json(request): Json<CreateScoringJobRequest>,
) -> Result<(StatusCode, Json<CreateScoringJobResponse>), ApiError> {
    request.validate()?;
    let job = state.producer.submit(request.submission_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateScoringJobResponse {
            message: "Scoring job queued".to_string(),
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /api/score-jobs/{job_id}: current durable state of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.producer.job_status(job_id).await?;
    Ok(Json(job.into()))
}
