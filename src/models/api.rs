use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{JobStatus, ScoringJob};
use super::submission::{ContentPatch, Submission, SubmissionStatus};

/// Request to queue a submission for scoring.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateScoringJobRequest {
    #[garde(skip)]
    pub submission_id: Uuid,
}

/// Response after queueing a scoring job.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateScoringJobResponse {
    pub message: String,
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub submission_id: Uuid,
    pub status: JobStatus,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl From<ScoringJob> for JobStatusResponse {
    fn from(job: ScoringJob) -> Self {
        Self {
            job_id: job.id,
            submission_id: job.submission_id,
            status: job.status,
            score: job.score,
            feedback: job.feedback,
            created_at: job.created_at,
            completed_at: job.completed_at,
            attempts: job.attempts,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubmissionRequest {
    #[garde(skip)]
    pub learner_id: Uuid,
    #[garde(skip)]
    pub simulation_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSubmissionRequest {
    #[garde(dive)]
    pub content: ContentPatch,
}

/// Returned by every submission endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub message: String,
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionResponse {
    pub fn new(message: impl Into<String>, submission: &Submission) -> Self {
        Self {
            message: message.into(),
            submission_id: submission.id,
            status: submission.status,
            updated_at: submission.updated_at,
        }
    }
}
