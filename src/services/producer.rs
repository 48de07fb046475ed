use std::sync::Arc;
use uuid::Uuid;

use crate::error::ScoringError;
use crate::models::job::{CreateResult, JobStatus, JobUpdate, ScoringJob, ScoringPayload};
use crate::models::submission::SubmissionStatus;
use crate::services::events::{EventSink, JobEventKind};
use crate::services::job_store::JobStore;
use crate::services::queue::Broker;
use crate::services::submissions::SubmissionStore;

/// Creates scoring jobs for finalized submissions and hands them to the broker.
#[derive(Clone)]
pub struct JobProducer {
    submissions: Arc<dyn SubmissionStore>,
    jobs: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    events: EventSink,
}

impl JobProducer {
    pub fn new(
        submissions: Arc<dyn SubmissionStore>,
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        events: EventSink,
    ) -> Self {
        Self {
            submissions,
            jobs,
            broker,
            events,
        }
    }

    /// Create and enqueue a job, or return the submission's active job.
    ///
    /// Resubmitting while a job is `QUEUED` or `RUNNING` never creates a
    /// second job or a second delivery.
    pub async fn submit(&self, submission_id: Uuid) -> Result<ScoringJob, ScoringError> {
        let submission = self
            .submissions
            .get(submission_id)
            .await?
            .ok_or_else(|| ScoringError::not_found("submission", submission_id))?;

        if submission.status != SubmissionStatus::Submitted {
            return Err(ScoringError::invalid_state(format!(
                "submission {submission_id} is {}; only SUBMITTED work can be scored",
                submission.status
            )));
        }

        if let Some(active) = self.jobs.find_active_by_submission(submission_id).await? {
            tracing::info!(
                job_id = %active.id,
                submission_id = %submission_id,
                status = %active.status,
                "Returning existing active scoring job"
            );
            return Ok(active);
        }

        let job = match self.jobs.create(submission_id).await? {
            CreateResult::Created(job) => job,
            CreateResult::Existing(job) => {
                tracing::info!(
                    job_id = %job.id,
                    submission_id = %submission_id,
                    "Concurrent submit already created a job"
                );
                return Ok(job);
            }
        };

        let payload = ScoringPayload {
            job_id: job.id,
            submission_id,
            content: submission.content,
        };

        if let Err(e) = self.broker.enqueue(&payload).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue scoring job");
            // Leave nothing active behind so a retry of the request can start over.
            let reason = format!("failed to enqueue: {e}");
            if let Err(store_err) = self
                .jobs
                .transition_if_status(job.id, JobStatus::Queued, JobUpdate::fail(reason))
                .await
            {
                tracing::error!(
                    job_id = %job.id,
                    error = %store_err,
                    "Failed to mark job as errored"
                );
            }
            return Err(e.into());
        }

        self.events.emit(job.id, JobEventKind::Created);
        tracing::info!(job_id = %job.id, submission_id = %submission_id, "Scoring job queued");
        Ok(job)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<ScoringJob, ScoringError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ScoringError::not_found("scoring job", job_id))
    }
}
