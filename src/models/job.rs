use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::submission::SubmissionContent;

/// Status of a scoring job.
///
/// `QUEUED -> RUNNING -> {DONE | ERROR}`, with `RUNNING -> QUEUED` on a
/// retryable failure. `DONE` and `ERROR` are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// A scoring job as persisted by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringJob {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub status: JobStatus,
    pub score: Option<i32>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Claims so far. Survives redeliveries and re-enqueues.
    pub attempts: u32,
}

impl ScoringJob {
    /// A freshly created job in `QUEUED`.
    pub fn queued(submission_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_id,
            status: JobStatus::Queued,
            score: None,
            feedback: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
        }
    }

    /// Apply an update in place. The caller is responsible for any status
    /// precondition; this only maps the update onto the fields.
    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status();
        match update {
            JobUpdate::Claim {
                started_at,
                attempt,
            } => {
                self.started_at = Some(*started_at);
                self.attempts = *attempt;
            }
            JobUpdate::Release => {
                self.started_at = None;
            }
            JobUpdate::Complete {
                score,
                feedback,
                completed_at,
            } => {
                self.score = Some(*score);
                self.feedback = Some(feedback.clone());
                self.completed_at = Some(*completed_at);
            }
            JobUpdate::Fail {
                feedback,
                completed_at,
            } => {
                self.score = Some(0);
                self.feedback = Some(feedback.clone());
                self.completed_at = Some(*completed_at);
            }
        }
    }
}

/// A status change together with the fields that status requires.
///
/// Bundling them keeps every write consistent with the data model:
/// score, feedback and completion time exist only on terminal jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// `QUEUED -> RUNNING`, recording that this is claim number `attempt`.
    Claim {
        started_at: DateTime<Utc>,
        attempt: u32,
    },
    /// Back to `QUEUED`, clearing the claim. The attempt count is kept.
    Release,
    /// Terminal success.
    Complete {
        score: i32,
        feedback: String,
        completed_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Fail {
        feedback: String,
        completed_at: DateTime<Utc>,
    },
}

impl JobUpdate {
    pub fn claim(attempt: u32) -> Self {
        Self::Claim {
            started_at: Utc::now(),
            attempt,
        }
    }

    pub fn complete(score: i32, feedback: impl Into<String>) -> Self {
        Self::Complete {
            score,
            feedback: feedback.into(),
            completed_at: Utc::now(),
        }
    }

    pub fn fail(feedback: impl Into<String>) -> Self {
        Self::Fail {
            feedback: feedback.into(),
            completed_at: Utc::now(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobUpdate::Claim { .. } => JobStatus::Running,
            JobUpdate::Release => JobStatus::Queued,
            JobUpdate::Complete { .. } => JobStatus::Done,
            JobUpdate::Fail { .. } => JobStatus::Error,
        }
    }
}

/// Outcome of asking the store to create a job for a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateResult {
    /// A new `QUEUED` job was inserted.
    Created(ScoringJob),
    /// An active job already existed for the submission.
    Existing(ScoringJob),
}

impl CreateResult {
    pub fn into_job(self) -> ScoringJob {
        match self {
            CreateResult::Created(job) | CreateResult::Existing(job) => job,
        }
    }
}

/// Payload carried by a broker delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringPayload {
    pub job_id: Uuid,
    pub submission_id: Uuid,
    pub content: SubmissionContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(JobStatus::Queued.to_string(), "QUEUED");
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!(
            serde_json::to_string(&JobStatus::Done).unwrap(),
            "\"DONE\""
        );
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_fields_only_on_terminal_status() {
        let mut job = ScoringJob::queued(Uuid::new_v4());
        assert!(job.score.is_none() && job.started_at.is_none());

        job.apply(&JobUpdate::claim(1));
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        job.apply(&JobUpdate::Release);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert_eq!(job.attempts, 1);

        job.apply(&JobUpdate::claim(2));
        assert_eq!(job.attempts, 2);
        job.apply(&JobUpdate::complete(72, "ok"));
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.score, Some(72));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_fail_sets_all_terminal_fields() {
        let mut job = ScoringJob::queued(Uuid::new_v4());
        job.apply(&JobUpdate::fail("failed after 3 attempts: boom"));
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.score, Some(0));
        assert!(job.feedback.as_deref().unwrap().contains("3 attempts"));
        assert!(job.completed_at.is_some());
    }
}
