//! Error taxonomy for the scoring pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::services::queue::QueueError;
use crate::services::scorer::ScorerError;

/// Failures of a job or submission store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Decode(String),

    #[error("Write kept conflicting: {0}")]
    Contention(String),
}

/// Pipeline-level errors.
#[derive(Debug, Error)]
pub enum ScoringError {
    /// A referenced entity is absent. Surfaced, never retried.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// The operation does not fit the entity's lifecycle state.
    #[error("{0}")]
    InvalidState(String),

    /// Another executor owns the job. Absorbed by the worker.
    #[error("claim on job {0} lost to another worker")]
    ClaimLost(Uuid),

    /// Scorer, store or broker failure; retried up to the attempt limit.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// A delivery references a job that does not exist.
    #[error("delivery references missing job {0}")]
    DataIntegrityFault(Uuid),
}

impl ScoringError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<StoreError> for ScoringError {
    fn from(e: StoreError) -> Self {
        Self::TransientFailure(e.to_string())
    }
}

impl From<QueueError> for ScoringError {
    fn from(e: QueueError) -> Self {
        Self::TransientFailure(e.to_string())
    }
}

impl From<ScorerError> for ScoringError {
    fn from(e: ScorerError) -> Self {
        Self::TransientFailure(e.to_string())
    }
}
