//! Learner submissions and their `IN_PROGRESS -> SUBMITTED` lifecycle.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{ScoringError, StoreError};
use crate::models::submission::{ContentPatch, Submission, SubmissionContent, SubmissionStatus};

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn create(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError>;

    /// Replace the content of an `IN_PROGRESS` submission. Returns `false`
    /// if the submission is missing or already finalized.
    async fn update_content(
        &self,
        id: Uuid,
        content: &SubmissionContent,
    ) -> Result<bool, StoreError>;

    /// `IN_PROGRESS -> SUBMITTED`. Returns `false` if the submission is
    /// missing or already finalized.
    async fn finalize(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    submissions: Mutex<HashMap<Uuid, Submission>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn submissions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Submission>> {
        self.submissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove a submission outright.
    pub fn remove(&self, id: Uuid) -> Option<Submission> {
        self.submissions().remove(&id)
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn create(&self, submission: &Submission) -> Result<(), StoreError> {
        self.submissions()
            .insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions().get(&id).cloned())
    }

    async fn update_content(
        &self,
        id: Uuid,
        content: &SubmissionContent,
    ) -> Result<bool, StoreError> {
        let mut submissions = self.submissions();
        match submissions.get_mut(&id) {
            Some(s) if s.status == SubmissionStatus::InProgress => {
                s.content = content.clone();
                s.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut submissions = self.submissions();
        match submissions.get_mut(&id) {
            Some(s) if s.status == SubmissionStatus::InProgress => {
                s.status = SubmissionStatus::Submitted;
                s.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Business rules around the submission store.
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn SubmissionStore>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn SubmissionStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        learner_id: Uuid,
        simulation_id: Uuid,
    ) -> Result<Submission, ScoringError> {
        let submission = Submission::new(learner_id, simulation_id);
        self.store.create(&submission).await?;
        tracing::info!(
            submission_id = %submission.id,
            learner_id = %learner_id,
            "Submission created"
        );
        Ok(submission)
    }

    pub async fn get(&self, id: Uuid) -> Result<Submission, ScoringError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ScoringError::not_found("submission", id))
    }

    /// Merge `patch` into the stored content. Only drafts can be edited.
    pub async fn update_content(
        &self,
        id: Uuid,
        patch: &ContentPatch,
    ) -> Result<Submission, ScoringError> {
        let current = self.get(id).await?;
        ensure_in_progress(&current, "update")?;

        let content = current.content.merged(patch);
        if !self.store.update_content(id, &content).await? {
            // Finalized between the read and the write.
            return Err(ScoringError::invalid_state(format!(
                "submission {id} is no longer in progress"
            )));
        }
        self.get(id).await
    }

    /// Finalize a draft so it can be scored.
    pub async fn submit(&self, id: Uuid) -> Result<Submission, ScoringError> {
        let current = self.get(id).await?;
        ensure_in_progress(&current, "submit")?;

        if !self.store.finalize(id).await? {
            return Err(ScoringError::invalid_state(format!(
                "submission {id} was already submitted"
            )));
        }
        tracing::info!(submission_id = %id, "Submission finalized");
        self.get(id).await
    }
}

fn ensure_in_progress(submission: &Submission, action: &str) -> Result<(), ScoringError> {
    if submission.status == SubmissionStatus::InProgress {
        Ok(())
    } else {
        Err(ScoringError::invalid_state(format!(
            "cannot {action} submission {} in status {}",
            submission.id, submission.status
        )))
    }
}
