use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a learner submission. Only `SUBMITTED` work can be scored.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    InProgress,
    Submitted,
}

/// What the learner hands in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionContent {
    #[serde(default)]
    pub source_code: String,
    #[serde(default)]
    pub documentation: String,
}

impl SubmissionContent {
    pub fn new(source_code: impl Into<String>, documentation: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            documentation: documentation.into(),
        }
    }

    /// Overlay the fields present in `patch`.
    pub fn merged(&self, patch: &ContentPatch) -> Self {
        Self {
            source_code: patch
                .source_code
                .clone()
                .unwrap_or_else(|| self.source_code.clone()),
            documentation: patch
                .documentation
                .clone()
                .unwrap_or_else(|| self.documentation.clone()),
        }
    }
}

/// Partial content update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, garde::Validate)]
pub struct ContentPatch {
    #[garde(length(max = 200_000))]
    pub source_code: Option<String>,
    #[garde(length(max = 50_000))]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub learner_id: Uuid,
    pub simulation_id: Uuid,
    pub status: SubmissionStatus,
    pub content: SubmissionContent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(learner_id: Uuid, simulation_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            learner_id,
            simulation_id,
            status: SubmissionStatus::InProgress,
            content: SubmissionContent::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
