//! Durable record of scoring jobs.
//!
//! The store is the single authority on who owns a job. Every ownership
//! change goes through [`JobStore::transition_if_status`], which must be one
//! atomic compare-and-set at the storage layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::job::{CreateResult, JobStatus, JobUpdate, ScoringJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `QUEUED` job unless the submission already has an active one.
    async fn create(&self, submission_id: Uuid) -> Result<CreateResult, StoreError>;

    /// The `QUEUED` or `RUNNING` job of a submission, if any.
    async fn find_active_by_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<ScoringJob>, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<ScoringJob>, StoreError>;

    /// Apply `update` only if the job is currently in `expected`.
    async fn transition_if_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<bool, StoreError>;

    /// Apply `update` regardless of the current non-terminal status. Jobs
    /// already in `DONE` or `ERROR` are left untouched and `false` is
    /// returned.
    async fn write(&self, job_id: Uuid, update: JobUpdate) -> Result<bool, StoreError>;

    /// `RUNNING` jobs claimed before `cutoff`.
    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScoringJob>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Mutex-guarded map. Each operation is one critical section.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, ScoringJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ScoringJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every job of a submission, oldest first.
    pub fn jobs_for_submission(&self, submission_id: Uuid) -> Vec<ScoringJob> {
        let mut jobs: Vec<ScoringJob> = self
            .jobs()
            .values()
            .filter(|job| job.submission_id == submission_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, submission_id: Uuid) -> Result<CreateResult, StoreError> {
        let mut jobs = self.jobs();
        if let Some(existing) = jobs
            .values()
            .find(|job| job.submission_id == submission_id && job.status.is_active())
        {
            return Ok(CreateResult::Existing(existing.clone()));
        }
        let job = ScoringJob::queued(submission_id);
        jobs.insert(job.id, job.clone());
        Ok(CreateResult::Created(job))
    }

    async fn find_active_by_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<ScoringJob>, StoreError> {
        Ok(self
            .jobs()
            .values()
            .find(|job| job.submission_id == submission_id && job.status.is_active())
            .cloned())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ScoringJob>, StoreError> {
        Ok(self.jobs().get(&job_id).cloned())
    }

    async fn transition_if_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == expected => {
                job.apply(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn write(&self, job_id: Uuid, update: JobUpdate) -> Result<bool, StoreError> {
        let mut jobs = self.jobs();
        match jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.apply(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScoringJob>, StoreError> {
        Ok(self
            .jobs()
            .values()
            .filter(|job| {
                job.status == JobStatus::Running
                    && job.started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_refuses_second_active_job() {
        let store = MemoryJobStore::new();
        let submission = Uuid::new_v4();

        let first = store.create(submission).await.unwrap();
        let CreateResult::Created(job) = first else {
            panic!("expected a new job");
        };
        assert_eq!(job.status, JobStatus::Queued);

        let second = store.create(submission).await.unwrap();
        assert_eq!(second, CreateResult::Existing(job.clone()));

        // Once terminal, a fresh job may be created.
        store.write(job.id, JobUpdate::fail("x")).await.unwrap();
        assert!(matches!(
            store.create(submission).await.unwrap(),
            CreateResult::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_transition_checks_expected_status() {
        let store = MemoryJobStore::new();
        let job = store.create(Uuid::new_v4()).await.unwrap().into_job();

        assert!(!store
            .transition_if_status(job.id, JobStatus::Running, JobUpdate::Release)
            .await
            .unwrap());
        assert!(store
            .transition_if_status(job.id, JobStatus::Queued, JobUpdate::claim(1))
            .await
            .unwrap());
        assert!(!store
            .transition_if_status(job.id, JobStatus::Queued, JobUpdate::claim(1))
            .await
            .unwrap());
        assert!(!store
            .transition_if_status(Uuid::new_v4(), JobStatus::Queued, JobUpdate::claim(1))
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create(Uuid::new_v4()).await.unwrap().into_job();

        let attempts = (0..32).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .transition_if_status(job.id, JobStatus::Queued, JobUpdate::claim(1))
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_write_never_leaves_terminal_state() {
        let store = MemoryJobStore::new();
        let job = store.create(Uuid::new_v4()).await.unwrap().into_job();
        store
            .transition_if_status(job.id, JobStatus::Queued, JobUpdate::claim(1))
            .await
            .unwrap();

        assert!(store.write(job.id, JobUpdate::complete(80, "good")).await.unwrap());
        assert!(!store.write(job.id, JobUpdate::fail("late")).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.score, Some(80));
    }

    #[tokio::test]
    async fn test_list_running_started_before() {
        let store = MemoryJobStore::new();
        let stale = store.create(Uuid::new_v4()).await.unwrap().into_job();
        let fresh = store.create(Uuid::new_v4()).await.unwrap().into_job();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        store
            .transition_if_status(
                stale.id,
                JobStatus::Queued,
                JobUpdate::Claim {
                    started_at: long_ago,
                    attempt: 1,
                },
            )
            .await
            .unwrap();
        store
            .transition_if_status(fresh.id, JobStatus::Queued, JobUpdate::claim(1))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let found = store.list_running_started_before(cutoff).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }
}
