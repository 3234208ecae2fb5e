use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use noteflow_core::domain::job::{JobErrorKind, JobId};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::provider::ModelId;
use noteflow_core::domain::quota::UserId;
use noteflow_core::domain::usage::{UsageOutcome, UsageRecord, UsageRecordId, UsageSummary};

use super::{encode_timestamp, parse_timestamp, parse_u32, RepositoryError, UsageRepository};
use crate::DbPool;

const USAGE_COLUMNS: &str = "id, user_id, model_id, operation, job_id, tokens_consumed,
    tokens_charged, cost, latency_ms, outcome, error_kind, recorded_at";

/// Append-only usage log.
pub struct SqlUsageRepository {
    pool: DbPool,
}

impl SqlUsageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UsageRepository for SqlUsageRepository {
    async fn append(&self, record: UsageRecord) -> Result<(), RepositoryError> {
        let latency_ms = i64::try_from(record.latency_ms).map_err(|_| {
            RepositoryError::Decode(format!("latency {} does not fit storage", record.latency_ms))
        })?;

        sqlx::query(&format!(
            "INSERT INTO usage_record ({USAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.id.0)
        .bind(&record.user_id.0)
        .bind(&record.model_id.0)
        .bind(record.operation.as_str())
        .bind(&record.job_id.0)
        .bind(i64::from(record.tokens_consumed))
        .bind(i64::from(record.tokens_charged))
        .bind(record.cost.to_string())
        .bind(latency_ms)
        .bind(record.outcome.as_str())
        .bind(record.error_kind.map(|kind| kind.as_str()))
        .bind(encode_timestamp(record.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS}
             FROM usage_record
             WHERE user_id = ?
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(&user_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(usage_from_row).collect()
    }

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<UsageRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS}
             FROM usage_record
             WHERE job_id = ?
             ORDER BY recorded_at ASC, id ASC"
        ))
        .bind(&job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(usage_from_row).collect()
    }

    async fn summarize(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        user_id: Option<&UserId>,
    ) -> Result<UsageSummary, RepositoryError> {
        // Cost is stored as decimal text, so aggregation happens in Rust.
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query(&format!(
                    "SELECT {USAGE_COLUMNS}
                     FROM usage_record
                     WHERE recorded_at >= ? AND recorded_at < ? AND user_id = ?"
                ))
                .bind(encode_timestamp(since))
                .bind(encode_timestamp(until))
                .bind(&user_id.0)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {USAGE_COLUMNS}
                     FROM usage_record
                     WHERE recorded_at >= ? AND recorded_at < ?"
                ))
                .bind(encode_timestamp(since))
                .bind(encode_timestamp(until))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let records = rows.into_iter().map(usage_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(UsageSummary::from_records(&records))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM usage_record WHERE recorded_at < ?")
            .bind(encode_timestamp(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

fn usage_from_row(row: SqliteRow) -> Result<UsageRecord, RepositoryError> {
    let operation_raw: String = row.try_get("operation")?;
    let operation = OperationType::parse(&operation_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unsupported operation: `{operation_raw}`"))
    })?;

    let outcome_raw: String = row.try_get("outcome")?;
    let outcome = UsageOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unsupported outcome: `{outcome_raw}`")))?;

    let error_kind = row
        .try_get::<Option<String>, _>("error_kind")?
        .map(|raw| {
            JobErrorKind::parse(&raw)
                .ok_or_else(|| RepositoryError::Decode(format!("unsupported error kind: `{raw}`")))
        })
        .transpose()?;

    let cost_raw: String = row.try_get("cost")?;
    let cost = Decimal::from_str(&cost_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid cost `{cost_raw}`: {error}")))?;

    let latency_raw: i64 = row.try_get("latency_ms")?;
    let latency_ms = u64::try_from(latency_raw)
        .map_err(|_| RepositoryError::Decode(format!("invalid latency_ms: {latency_raw}")))?;

    Ok(UsageRecord {
        id: UsageRecordId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        model_id: ModelId(row.try_get("model_id")?),
        operation,
        job_id: JobId(row.try_get("job_id")?),
        tokens_consumed: parse_u32("tokens_consumed", row.try_get("tokens_consumed")?)?,
        tokens_charged: parse_u32("tokens_charged", row.try_get("tokens_charged")?)?,
        cost,
        latency_ms,
        outcome,
        error_kind,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
    })
}
