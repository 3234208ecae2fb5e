use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::job::{JobErrorKind, JobId};
use crate::domain::operation::OperationType;
use crate::domain::provider::ModelId;
use crate::domain::quota::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageRecordId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Failure,
}

impl UsageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: UsageRecordId,
    pub user_id: UserId,
    pub model_id: ModelId,
    pub operation: OperationType,
    pub job_id: JobId,
    /// Tokens the provider reported.
    pub tokens_consumed: u32,
    /// Tokens committed against the user's quota.
    pub tokens_charged: u32,
    pub cost: Decimal,
    pub latency_ms: u64,
    pub outcome: UsageOutcome,
    pub error_kind: Option<JobErrorKind>,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate over a window of usage records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub avg_latency_ms: u64,
    pub unique_users: u64,
}

impl UsageSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut summary = Self::default();
        let mut users = std::collections::BTreeSet::new();
        let mut latency_total: u64 = 0;

        for record in records {
            summary.total_requests += 1;
            if record.outcome == UsageOutcome::Success {
                summary.successful_requests += 1;
            }
            summary.total_tokens += u64::from(record.tokens_consumed);
            summary.total_cost += record.cost;
            latency_total += record.latency_ms;
            users.insert(record.user_id.0.clone());
        }

        if summary.total_requests > 0 {
            summary.avg_latency_ms = latency_total / summary.total_requests;
        }
        summary.unique_users = users.len() as u64;
        summary
    }
}
