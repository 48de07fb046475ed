use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ScoringError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Scoring(ScoringError),
    Validation(String),
}

impl From<ScoringError> for ApiError {
    fn from(e: ScoringError) -> Self {
        Self::Scoring(e)
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        Self::Validation(report.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Validation(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", message)
            }
            ApiError::Scoring(e) => match &e {
                ScoringError::NotFound { .. } => {
                    (StatusCode::NOT_FOUND, "not_found", e.to_string())
                }
                ScoringError::InvalidState(_) => {
                    (StatusCode::CONFLICT, "invalid_state", e.to_string())
                }
                _ => {
                    tracing::error!(error = %e, "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "Internal server error".to_string(),
                    )
                }
            },
        };

        let body = ErrorBody {
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
