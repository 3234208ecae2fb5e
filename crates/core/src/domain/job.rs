use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::operation::OperationType;
use crate::domain::provider::{ModelId, ProviderId};
use crate::domain::quota::{ReservationId, UserId};
use crate::domain::template::RenderedPrompt;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTransitionId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Note,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Task => "task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "note" => Some(Self::Note),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

/// The note or task an operation's result is written back to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetEntity {
    pub kind: EntityKind,
    pub id: String,
}

impl TargetEntity {
    pub fn note(id: impl Into<String>) -> Self {
        Self { kind: EntityKind::Note, id: id.into() }
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self { kind: EntityKind::Task, id: id.into() }
    }
}

impl std::fmt::Display for TargetEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Classification recorded on a failed job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    ProviderUnavailable,
    RateLimited,
    InvalidResponse,
    Cancelled,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "provider_unavailable",
            Self::RateLimited => "rate_limited",
            Self::InvalidResponse => "invalid_response",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "provider_unavailable" => Some(Self::ProviderUnavailable),
            "rate_limited" => Some(Self::RateLimited),
            "invalid_response" => Some(Self::InvalidResponse),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

/// Structured output of a completed operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationResult {
    Summary { text: String },
    Keywords { keywords: Vec<String> },
    Sentiment { label: String },
    Tags { tags: Vec<String> },
    Topics { topics: Vec<String> },
    Subtasks { subtasks: Vec<String> },
    Priority { level: String },
    TimeEstimate { minutes: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiOperationJob {
    pub id: JobId,
    pub user_id: UserId,
    pub target: TargetEntity,
    pub operation: OperationType,
    pub input_text: String,
    pub input_hash: String,
    pub provider_id: ProviderId,
    pub model_id: ModelId,
    pub request: RenderedPrompt,
    /// Outstanding quota reservation; cleared once committed or released.
    pub reservation_id: Option<ReservationId>,
    pub estimated_tokens: u32,
    pub status: JobStatus,
    pub result: Option<OperationResult>,
    pub error: Option<JobError>,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub cancel_requested: bool,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransitionEvent {
    pub id: JobTransitionId,
    pub job_id: JobId,
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    pub reason: String,
    pub error_kind: Option<JobErrorKind>,
    pub context_json: String,
    pub actor: String,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{EntityKind, JobErrorKind, JobStatus, OperationResult};

    #[test]
    fn job_status_round_trips_from_storage_encoding() {
        for status in
            [JobStatus::Queued, JobStatus::Running, JobStatus::Succeeded, JobStatus::Failed]
        {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn error_kind_and_entity_kind_parse_storage_values() {
        assert_eq!(JobErrorKind::parse("rate_limited"), Some(JobErrorKind::RateLimited));
        assert_eq!(JobErrorKind::parse("exploded"), None);
        assert_eq!(EntityKind::parse("TASK"), Some(EntityKind::Task));
    }

    #[test]
    fn operation_result_serializes_with_type_tag() {
        let value = serde_json::to_value(OperationResult::TimeEstimate { minutes: 45 })
            .expect("serialize result");
        assert_eq!(value["type"], "time_estimate");
        assert_eq!(value["minutes"], 45);
    }
}
