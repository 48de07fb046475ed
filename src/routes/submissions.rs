use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{CreateSubmissionRequest, SubmissionResponse, UpdateSubmissionRequest};
use crate::routes::error::ApiError;

/// POST /api/submissions: start a draft.
pub async fn create_submission(
    State(state): State<AppState>,
    Json(request): Json<CreateSubmissionRequest>,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError> {
    request.validate()?;
    let submission = state
        .submission_service
        .create(request.learner_id, request.simulation_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmissionResponse::new("Submission created", &submission)),
    ))
}

/// PATCH /api/submissions/{id}: save draft content.
pub async fn update_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSubmissionRequest>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    request.validate()?;
    let submission = state
        .submission_service
        .update_content(id, &request.content)
        .await?;
    Ok(Json(SubmissionResponse::new("Submission updated", &submission)))
}

/// POST /api/submissions/{id}/submit: finalize a draft.
pub async fn submit_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    let submission = state.submission_service.submit(id).await?;
    Ok(Json(SubmissionResponse::new("Submission finalized", &submission)))
}
