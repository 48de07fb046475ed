use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::job::{CreateResult, JobStatus, JobUpdate, ScoringJob};
use crate::services::job_store::JobStore;

const JOB_COLUMNS: &str =
    "id, submission_id, status, score, feedback, created_at, started_at, completed_at, attempts";

/// Attempts at `create` before giving up on a submission whose active job
/// keeps finishing between the insert and the lookup.
const CREATE_ATTEMPTS: usize = 3;

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a QUEUED job unless the partial unique index already holds an
    /// active one for the submission.
    async fn try_insert(&self, submission_id: Uuid) -> Result<Option<ScoringJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO scoring_jobs (id, submission_id, status, created_at)
            VALUES ($1, $2, 'QUEUED', NOW())
            ON CONFLICT DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Shared by `transition_if_status` and `write`; `guard` is the extra
    /// WHERE clause that makes the update conditional.
    async fn apply(
        &self,
        job_id: Uuid,
        update: &JobUpdate,
        guard: &str,
        expected: Option<JobStatus>,
    ) -> Result<bool, StoreError> {
        let fields = UpdateFields::from(update);
        let sql = format!(
            r#"
            UPDATE scoring_jobs
            SET status = $2,
                started_at = CASE WHEN $3 THEN $4 ELSE started_at END,
                score = $5,
                feedback = $6,
                completed_at = $7,
                attempts = COALESCE($8, attempts)
            WHERE id = $1 AND {guard}
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(job_id)
            .bind(update.status().to_string())
            .bind(fields.set_started)
            .bind(fields.started_at)
            .bind(fields.score)
            .bind(fields.feedback)
            .bind(fields.completed_at)
            .bind(fields.attempts);
        if let Some(expected) = expected {
            query = query.bind(expected.to_string());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Column values written for a `JobUpdate`.
struct UpdateFields<'a> {
    set_started: bool,
    started_at: Option<DateTime<Utc>>,
    score: Option<i32>,
    feedback: Option<&'a str>,
    completed_at: Option<DateTime<Utc>>,
    attempts: Option<i32>,
}

impl<'a> From<&'a JobUpdate> for UpdateFields<'a> {
    fn from(update: &'a JobUpdate) -> Self {
        match update {
            JobUpdate::Claim {
                started_at,
                attempt,
            } => Self {
                set_started: true,
                started_at: Some(*started_at),
                score: None,
                feedback: None,
                completed_at: None,
                attempts: Some(i32::try_from(*attempt).unwrap_or(i32::MAX)),
            },
            JobUpdate::Release => Self {
                set_started: true,
                started_at: None,
                score: None,
                feedback: None,
                completed_at: None,
                attempts: None,
            },
            JobUpdate::Complete {
                score,
                feedback,
                completed_at,
            } => Self {
                set_started: false,
                started_at: None,
                score: Some(*score),
                feedback: Some(feedback),
                completed_at: Some(*completed_at),
                attempts: None,
            },
            JobUpdate::Fail {
                feedback,
                completed_at,
            } => Self {
                set_started: false,
                started_at: None,
                score: Some(0),
                feedback: Some(feedback),
                completed_at: Some(*completed_at),
                attempts: None,
            },
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<ScoringJob, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|_| StoreError::Decode(format!("unknown job status '{status}'")))?;
    let attempts: i32 = row.try_get("attempts")?;
    let attempts = u32::try_from(attempts)
        .map_err(|_| StoreError::Decode(format!("negative attempt count {attempts}")))?;

    Ok(ScoringJob {
        id: row.try_get("id")?,
        submission_id: row.try_get("submission_id")?,
        status,
        score: row.try_get("score")?,
        feedback: row.try_get("feedback")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        attempts,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, submission_id: Uuid) -> Result<CreateResult, StoreError> {
        for _ in 0..CREATE_ATTEMPTS {
            if let Some(job) = self.try_insert(submission_id).await? {
                return Ok(CreateResult::Created(job));
            }
            if let Some(job) = self.find_active_by_submission(submission_id).await? {
                return Ok(CreateResult::Existing(job));
            }
        }
        Err(StoreError::Contention(format!(
            "could not create a job for submission {submission_id}"
        )))
    }

    async fn find_active_by_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<ScoringJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scoring_jobs
            WHERE submission_id = $1 AND status IN ('QUEUED', 'RUNNING')
            LIMIT 1
            "#
        ))
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ScoringJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scoring_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition_if_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<bool, StoreError> {
        self.apply(job_id, &update, "status = $9", Some(expected))
            .await
    }

    async fn write(&self, job_id: Uuid, update: JobUpdate) -> Result<bool, StoreError> {
        self.apply(job_id, &update, "status NOT IN ('DONE', 'ERROR')", None)
            .await
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ScoringJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scoring_jobs
            WHERE status = 'RUNNING' AND started_at < $1
            ORDER BY started_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_clears_claim_columns() {
        let fields = UpdateFields::from(&JobUpdate::Release);
        assert!(fields.set_started);
        assert!(fields.started_at.is_none());
        assert!(fields.score.is_none() && fields.completed_at.is_none());
        assert!(fields.attempts.is_none());
    }

    #[test]
    fn test_claim_records_attempt() {
        let claim = JobUpdate::claim(3);
        let fields = UpdateFields::from(&claim);
        assert!(fields.set_started && fields.started_at.is_some());
        assert_eq!(fields.attempts, Some(3));
    }

    #[test]
    fn test_terminal_updates_keep_started_at() {
        let done = JobUpdate::complete(90, "great");
        let fields = UpdateFields::from(&done);
        assert!(!fields.set_started);
        assert_eq!(fields.score, Some(90));
        assert_eq!(fields.feedback, Some("great"));

        let failed = JobUpdate::fail("failed after 3 attempts: boom");
        let fields = UpdateFields::from(&failed);
        assert!(!fields.set_started);
        assert_eq!(fields.score, Some(0));
        assert!(fields.completed_at.is_some());
    }
}
