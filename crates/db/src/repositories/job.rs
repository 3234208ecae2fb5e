use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use noteflow_core::domain::job::{
    AiOperationJob, EntityKind, JobError, JobErrorKind, JobId, JobStatus, JobTransitionEvent,
    JobTransitionId, OperationResult, TargetEntity,
};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::provider::{ModelId, ProviderId};
use noteflow_core::domain::quota::{ReservationId, UserId};
use noteflow_core::domain::template::RenderedPrompt;

use super::{
    encode_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, JobInsert,
    JobRepository, RepositoryError,
};
use crate::DbPool;

const JOB_COLUMNS: &str = "id, user_id, target_kind, target_id, operation, input_text,
    input_hash, provider_id, model_id, request_json, reservation_id, estimated_tokens,
    status, result_json, error_kind, error_message, attempt_count, max_retries,
    cancel_requested, claimed_by, claimed_at, state_version, created_at, updated_at,
    started_at, finished_at";

pub struct SqlJobRepository {
    pool: DbPool,
}

impl SqlJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JobRepository for SqlJobRepository {
    async fn insert_job(
        &self,
        job: AiOperationJob,
        transition: JobTransitionEvent,
    ) -> Result<JobInsert, RepositoryError> {
        let request_json = encode_json("request_json", &job.request)?;
        let result_json =
            job.result.as_ref().map(|result| encode_json("result_json", result)).transpose()?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO ai_operation_job ({JOB_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&job.id.0)
        .bind(&job.user_id.0)
        .bind(job.target.kind.as_str())
        .bind(&job.target.id)
        .bind(job.operation.as_str())
        .bind(&job.input_text)
        .bind(&job.input_hash)
        .bind(&job.provider_id.0)
        .bind(&job.model_id.0)
        .bind(request_json)
        .bind(job.reservation_id.as_ref().map(|id| id.0.clone()))
        .bind(i64::from(job.estimated_tokens))
        .bind(job.status.as_str())
        .bind(result_json)
        .bind(job.error.as_ref().map(|error| error.kind.as_str()))
        .bind(job.error.as_ref().map(|error| error.message.clone()))
        .bind(i64::from(job.attempt_count))
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.cancel_requested))
        .bind(job.claimed_by.clone())
        .bind(job.claimed_at.map(encode_timestamp))
        .bind(i64::from(job.state_version))
        .bind(encode_timestamp(job.created_at))
        .bind(encode_timestamp(job.updated_at))
        .bind(job.started_at.map(encode_timestamp))
        .bind(job.finished_at.map(encode_timestamp))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                tx.rollback().await?;
                let existing = self.find_active_for_target(&job.target, job.operation).await?;
                return match existing {
                    Some(existing) => Ok(JobInsert::Conflict(existing)),
                    None => Err(RepositoryError::Decode(format!(
                        "job `{}` collided with an existing row",
                        job.id
                    ))),
                };
            }
            Err(error) => return Err(error.into()),
        }

        insert_transition(&mut tx, &transition).await?;
        tx.commit().await?;
        Ok(JobInsert::Created)
    }

    async fn find_job(&self, id: &JobId) -> Result<Option<AiOperationJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM ai_operation_job WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn find_active_for_target(
        &self,
        target: &TargetEntity,
        operation: OperationType,
    ) -> Result<Option<AiOperationJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM ai_operation_job
             WHERE target_kind = ? AND target_id = ? AND operation = ?
               AND status IN ('queued', 'running')
             LIMIT 1"
        ))
        .bind(target.kind.as_str())
        .bind(&target.id)
        .bind(operation.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn find_recent_success(
        &self,
        target: &TargetEntity,
        operation: OperationType,
        input_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AiOperationJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM ai_operation_job
             WHERE target_kind = ? AND target_id = ? AND operation = ?
               AND input_hash = ? AND status = 'succeeded' AND finished_at >= ?
             ORDER BY finished_at DESC
             LIMIT 1"
        ))
        .bind(target.kind.as_str())
        .bind(&target.id)
        .bind(operation.as_str())
        .bind(input_hash)
        .bind(encode_timestamp(since))
        .fetch_optional(&self.pool)
        .await?;

        row.map(job_from_row).transpose()
    }

    async fn list_jobs_for_target(
        &self,
        target: &TargetEntity,
    ) -> Result<Vec<AiOperationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM ai_operation_job
             WHERE target_kind = ? AND target_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(target.kind.as_str())
        .bind(&target.id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
    ) -> Result<Vec<AiOperationJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}
             FROM ai_operation_job
             WHERE status = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    async fn apply_transition(
        &self,
        job: &AiOperationJob,
        expected_version: u32,
        transition: JobTransitionEvent,
    ) -> Result<bool, RepositoryError> {
        let result_json =
            job.result.as_ref().map(|result| encode_json("result_json", result)).transpose()?;

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE ai_operation_job
             SET status = ?,
                 reservation_id = ?,
                 result_json = ?,
                 error_kind = ?,
                 error_message = ?,
                 attempt_count = MAX(attempt_count, ?),
                 cancel_requested = MAX(cancel_requested, ?),
                 claimed_by = ?,
                 claimed_at = ?,
                 state_version = ?,
                 updated_at = ?,
                 started_at = ?,
                 finished_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(job.status.as_str())
        .bind(job.reservation_id.as_ref().map(|id| id.0.clone()))
        .bind(result_json)
        .bind(job.error.as_ref().map(|error| error.kind.as_str()))
        .bind(job.error.as_ref().map(|error| error.message.clone()))
        .bind(i64::from(job.attempt_count))
        .bind(i64::from(job.cancel_requested))
        .bind(job.claimed_by.clone())
        .bind(job.claimed_at.map(encode_timestamp))
        .bind(i64::from(job.state_version))
        .bind(encode_timestamp(job.updated_at))
        .bind(job.started_at.map(encode_timestamp))
        .bind(job.finished_at.map(encode_timestamp))
        .bind(&job.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_transition(&mut tx, &transition).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn renew_claim(
        &self,
        id: &JobId,
        worker_id: &str,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE ai_operation_job
             SET attempt_count = MAX(attempt_count, ?),
                 claimed_at = ?,
                 updated_at = ?
             WHERE id = ? AND status = 'running' AND claimed_by = ?",
        )
        .bind(i64::from(attempt_count))
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn request_cancel(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE ai_operation_job
             SET cancel_requested = 1, updated_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn list_transitions(
        &self,
        id: &JobId,
    ) -> Result<Vec<JobTransitionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                job_id,
                from_status,
                to_status,
                reason,
                error_kind,
                context_json,
                actor,
                state_version,
                occurred_at
             FROM ai_job_transition_audit
             WHERE job_id = ?
             ORDER BY state_version ASC, occurred_at ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

async fn insert_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    transition: &JobTransitionEvent,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO ai_job_transition_audit (
            id,
            job_id,
            from_status,
            to_status,
            reason,
            error_kind,
            context_json,
            actor,
            state_version,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transition.id.0)
    .bind(&transition.job_id.0)
    .bind(transition.from_status.map(|status| status.as_str()))
    .bind(transition.to_status.as_str())
    .bind(&transition.reason)
    .bind(transition.error_kind.map(|kind| kind.as_str()))
    .bind(&transition.context_json)
    .bind(&transition.actor)
    .bind(i64::from(transition.state_version))
    .bind(encode_timestamp(transition.occurred_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn encode_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

fn parse_status(column: &str, value: &str) -> Result<JobStatus, RepositoryError> {
    JobStatus::parse(value).ok_or_else(|| {
        RepositoryError::Decode(format!("unsupported job status in `{column}`: `{value}`"))
    })
}

fn parse_error_kind(column: &str, value: &str) -> Result<JobErrorKind, RepositoryError> {
    JobErrorKind::parse(value).ok_or_else(|| {
        RepositoryError::Decode(format!("unsupported error kind in `{column}`: `{value}`"))
    })
}

fn job_from_row(row: SqliteRow) -> Result<AiOperationJob, RepositoryError> {
    let target_kind: String = row.try_get("target_kind")?;
    let kind = EntityKind::parse(&target_kind).ok_or_else(|| {
        RepositoryError::Decode(format!("unsupported target kind: `{target_kind}`"))
    })?;

    let operation_raw: String = row.try_get("operation")?;
    let operation = OperationType::parse(&operation_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unsupported operation: `{operation_raw}`"))
    })?;

    let status_raw: String = row.try_get("status")?;
    let request_raw: String = row.try_get("request_json")?;
    let request: RenderedPrompt = decode_json("request_json", &request_raw)?;

    let result = row
        .try_get::<Option<String>, _>("result_json")?
        .map(|raw| decode_json::<OperationResult>("result_json", &raw))
        .transpose()?;

    let error_kind = row
        .try_get::<Option<String>, _>("error_kind")?
        .map(|raw| parse_error_kind("error_kind", &raw))
        .transpose()?;
    let error = error_kind.map(|kind| -> Result<JobError, RepositoryError> {
        Ok(JobError {
            kind,
            message: row.try_get::<Option<String>, _>("error_message")?.unwrap_or_default(),
        })
    });

    Ok(AiOperationJob {
        id: JobId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        target: TargetEntity { kind, id: row.try_get("target_id")? },
        operation,
        input_text: row.try_get("input_text")?,
        input_hash: row.try_get("input_hash")?,
        provider_id: ProviderId(row.try_get("provider_id")?),
        model_id: ModelId(row.try_get("model_id")?),
        request,
        reservation_id: row.try_get::<Option<String>, _>("reservation_id")?.map(ReservationId),
        estimated_tokens: parse_u32("estimated_tokens", row.try_get("estimated_tokens")?)?,
        status: parse_status("status", &status_raw)?,
        result,
        error: error.transpose()?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<JobTransitionEvent, RepositoryError> {
    let from_status = row
        .try_get::<Option<String>, _>("from_status")?
        .map(|raw| parse_status("from_status", &raw))
        .transpose()?;
    let to_status_raw: String = row.try_get("to_status")?;
    let error_kind = row
        .try_get::<Option<String>, _>("error_kind")?
        .map(|raw| parse_error_kind("error_kind", &raw))
        .transpose()?;

    Ok(JobTransitionEvent {
        id: JobTransitionId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        from_status,
        to_status: parse_status("to_status", &to_status_raw)?,
        reason: row.try_get("reason")?,
        error_kind,
        context_json: row.try_get("context_json")?,
        actor: row.try_get("actor")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
