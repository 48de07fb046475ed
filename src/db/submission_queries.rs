use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::submission::{Submission, SubmissionContent, SubmissionStatus};
use crate::services::submissions::SubmissionStore;

/// Postgres-backed submission store. Content is kept as one JSONB document.
#[derive(Clone)]
pub struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn submission_from_row(row: &PgRow) -> Result<Submission, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<SubmissionStatus>()
        .map_err(|_| StoreError::Decode(format!("unknown submission status '{status}'")))?;
    let Json(content): Json<SubmissionContent> = row.try_get("content")?;

    Ok(Submission {
        id: row.try_get("id")?,
        learner_id: row.try_get("learner_id")?,
        simulation_id: row.try_get("simulation_id")?,
        status,
        content,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn create(&self, submission: &Submission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO submissions
                (id, learner_id, simulation_id, status, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(submission.id)
        .bind(submission.learner_id)
        .bind(submission.simulation_id)
        .bind(submission.status.to_string())
        .bind(Json(&submission.content))
        .bind(submission.created_at)
        .bind(submission.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, learner_id, simulation_id, status, content, created_at, updated_at
            FROM submissions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(submission_from_row).transpose()
    }

    async fn update_content(
        &self,
        id: Uuid,
        content: &SubmissionContent,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET content = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(id)
        .bind(Json(content))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finalize(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET status = 'SUBMITTED', updated_at = NOW()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
