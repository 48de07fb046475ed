//! Recovery of orphaned `RUNNING` jobs.
//!
//! An executor that dies after claiming a job leaves it `RUNNING` with no
//! live broker lock. Redeliveries of such a job lose the claim forever, so
//! the reaper periodically hands these jobs back to `QUEUED` and enqueues
//! them again.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::ScoringError;
use crate::models::job::{JobStatus, JobUpdate, ScoringJob, ScoringPayload};
use crate::services::events::{EventSink, JobEventKind};
use crate::services::job_store::JobStore;
use crate::services::queue::Broker;
use crate::services::submissions::SubmissionStore;
use crate::services::worker::pause;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// A `RUNNING` job claimed longer ago than this is a candidate.
    pub stale_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
        }
    }
}

pub struct StaleJobReaper {
    jobs: Arc<dyn JobStore>,
    submissions: Arc<dyn SubmissionStore>,
    broker: Arc<dyn Broker>,
    events: EventSink,
    config: ReaperConfig,
}

impl StaleJobReaper {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        submissions: Arc<dyn SubmissionStore>,
        broker: Arc<dyn Broker>,
        events: EventSink,
        config: ReaperConfig,
    ) -> Self {
        Self {
            jobs,
            submissions,
            broker,
            events,
            config,
        }
    }

    /// One sweep. Returns how many jobs were recovered.
    pub async fn run_once(&self) -> Result<usize, ScoringError> {
        let Some(cutoff) = chrono::Duration::from_std(self.config.stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let mut recovered = 0;
        for job in self.jobs.list_running_started_before(cutoff).await? {
            if self.broker.is_locked(job.id).await? {
                continue;
            }
            if self.recover(&job).await? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "Stale job sweep finished");
        }
        Ok(recovered)
    }

    async fn recover(&self, job: &ScoringJob) -> Result<bool, ScoringError> {
        let Some(submission) = self.submissions.get(job.submission_id).await? else {
            let feedback = format!("submission {} no longer exists", job.submission_id);
            let failed = self
                .jobs
                .transition_if_status(job.id, JobStatus::Running, JobUpdate::fail(feedback))
                .await?;
            if failed {
                tracing::error!(
                    job_id = %job.id,
                    submission_id = %job.submission_id,
                    "Orphaned job has no submission"
                );
                self.events.emit(
                    job.id,
                    JobEventKind::Failed {
                        attempts: job.attempts,
                        reason: "submission missing".to_string(),
                    },
                );
            }
            return Ok(false);
        };

        if !self
            .jobs
            .transition_if_status(job.id, JobStatus::Running, JobUpdate::Release)
            .await?
        {
            // Finished or released while we were looking.
            return Ok(false);
        }

        let payload = ScoringPayload {
            job_id: job.id,
            submission_id: job.submission_id,
            content: submission.content,
        };
        if let Err(e) = self.broker.enqueue(&payload).await {
            // Put the claim back so the next sweep sees the job again.
            let restore = JobUpdate::Claim {
                started_at: job.started_at.unwrap_or_else(Utc::now),
                attempt: job.attempts,
            };
            self.jobs
                .transition_if_status(job.id, JobStatus::Queued, restore)
                .await?;
            return Err(e.into());
        }

        tracing::warn!(job_id = %job.id, started_at = ?job.started_at, "Requeued orphaned job");
        self.events.emit(job.id, JobEventKind::Reaped);
        Ok(true)
    }

    /// Sweep every `interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            stale_after_ms = self.config.stale_after.as_millis() as u64,
            "Stale job reaper started"
        );
        while pause(&mut shutdown, self.config.interval).await {
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Stale job sweep failed");
            }
        }
        tracing::info!("Stale job reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::submission::{Submission, SubmissionContent, SubmissionStatus};
    use crate::services::job_store::MemoryJobStore;
    use crate::services::queue::MemoryBroker;
    use crate::services::submissions::MemorySubmissionStore;
    use uuid::Uuid;

    struct Fixture {
        jobs: Arc<MemoryJobStore>,
        submissions: Arc<MemorySubmissionStore>,
        broker: Arc<MemoryBroker>,
        reaper: StaleJobReaper,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let submissions = Arc::new(MemorySubmissionStore::new());
        let broker = Arc::new(MemoryBroker::with_lock_duration(Duration::from_millis(20)));
        let reaper = StaleJobReaper::new(
            jobs.clone(),
            submissions.clone(),
            broker.clone(),
            EventSink::disabled(),
            ReaperConfig {
                interval: Duration::from_millis(10),
                stale_after: Duration::from_millis(30),
            },
        );
        Fixture {
            jobs,
            submissions,
            broker,
            reaper,
        }
    }

    /// A job claimed long ago by an executor that never came back.
    async fn orphan(f: &Fixture) -> ScoringJob {
        let mut submission = Submission::new(Uuid::new_v4(), Uuid::new_v4());
        submission.status = SubmissionStatus::Submitted;
        submission.content = SubmissionContent::new("let x = 1;", "docs");
        f.submissions.create(&submission).await.unwrap();

        let job = f.jobs.create(submission.id).await.unwrap().into_job();
        f.jobs
            .transition_if_status(
                job.id,
                JobStatus::Queued,
                JobUpdate::Claim {
                    started_at: Utc::now() - chrono::Duration::minutes(5),
                    attempt: 1,
                },
            )
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn test_requeues_unlocked_running_job() {
        let f = fixture();
        let job = orphan(&f).await;

        assert_eq!(f.reaper.run_once().await.unwrap(), 1);
        let stored = f.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored.started_at.is_none());
        assert_eq!(stored.attempts, 1);

        let delivery = f.broker.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.job_id(), job.id);
        assert_eq!(delivery.payload.content.source_code, "let x = 1;");
    }

    #[tokio::test]
    async fn test_leaves_locked_job_alone() {
        let f = fixture();
        let job = orphan(&f).await;
        f.broker
            .enqueue(&ScoringPayload {
                job_id: job.id,
                submission_id: job.submission_id,
                content: SubmissionContent::default(),
            })
            .await
            .unwrap();
        let _lease = f.broker.dequeue().await.unwrap().unwrap();

        assert_eq!(f.reaper.run_once().await.unwrap(), 0);
        let stored = f.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_fresh_claims_are_not_stale() {
        let f = fixture();
        let job = f.jobs.create(Uuid::new_v4()).await.unwrap().into_job();
        f.jobs
            .transition_if_status(job.id, JobStatus::Queued, JobUpdate::claim(1))
            .await
            .unwrap();
        assert_eq!(f.reaper.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_submission_terminates_job() {
        let f = fixture();
        let job = orphan(&f).await;
        f.submissions.remove(job.submission_id);

        assert_eq!(f.reaper.run_once().await.unwrap(), 0);
        let stored = f.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.feedback.unwrap().contains("no longer exists"));
    }
}
