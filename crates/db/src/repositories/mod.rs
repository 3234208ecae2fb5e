use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use noteflow_core::domain::job::{
    AiOperationJob, JobId, JobStatus, JobTransitionEvent, TargetEntity,
};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::quota::{QuotaReservation, QuotaState, ReservationId, UserId};
use noteflow_core::domain::usage::{UsageRecord, UsageSummary};
use noteflow_core::errors::{ApplicationError, DispatchError};
use noteflow_core::quota::QuotaDefaults;

pub mod job;
pub mod memory;
pub mod quota;
pub mod usage;

pub use job::SqlJobRepository;
pub use memory::{InMemoryJobRepository, InMemoryQuotaLedger, InMemoryUsageRepository};
pub use quota::SqlQuotaLedger;
pub use usage::SqlUsageRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Ledger failures: a business rejection or a storage fault.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Rejected(#[from] DispatchError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<sqlx::Error> for LedgerError {
    fn from(error: sqlx::Error) -> Self {
        Self::Repository(RepositoryError::Database(error))
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        Self::Persistence(error.to_string())
    }
}

impl From<LedgerError> for ApplicationError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Rejected(error) => Self::Dispatch(error),
            LedgerError::Repository(error) => error.into(),
        }
    }
}

/// Outcome of inserting a job under the one-active-job-per-target rule.
#[derive(Clone, Debug, PartialEq)]
pub enum JobInsert {
    Created,
    /// Another non-terminal job already owns the (target, operation) slot.
    Conflict(AiOperationJob),
}

/// Per-user quota accounting with the reservation protocol. Every method
/// applies the lazy monthly reset and creates missing rows from `defaults`.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn get_quota_state(
        &self,
        user_id: &UserId,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError>;

    /// Atomically admits and holds one request plus `estimated_tokens`.
    async fn check_and_reserve(
        &self,
        user_id: &UserId,
        estimated_tokens: u32,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaReservation, LedgerError>;

    /// Consumes the reservation and returns the tokens charged.
    async fn commit(
        &self,
        reservation_id: &ReservationId,
        actual_tokens: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, LedgerError>;

    async fn release(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    async fn set_limits(
        &self,
        user_id: &UserId,
        max_requests: u32,
        max_tokens: u32,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError>;

    /// Resets every quota whose period has elapsed; returns how many rows changed.
    async fn reset_due(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;

    async fn outstanding_reservations(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<QuotaReservation>, LedgerError>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert_job(
        &self,
        job: AiOperationJob,
        transition: JobTransitionEvent,
    ) -> Result<JobInsert, RepositoryError>;

    async fn find_job(&self, id: &JobId) -> Result<Option<AiOperationJob>, RepositoryError>;

    async fn find_active_for_target(
        &self,
        target: &TargetEntity,
        operation: OperationType,
    ) -> Result<Option<AiOperationJob>, RepositoryError>;

    /// Latest job that succeeded at or after `since` on the same input.
    async fn find_recent_success(
        &self,
        target: &TargetEntity,
        operation: OperationType,
        input_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AiOperationJob>, RepositoryError>;

    async fn list_jobs_for_target(
        &self,
        target: &TargetEntity,
    ) -> Result<Vec<AiOperationJob>, RepositoryError>;

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
    ) -> Result<Vec<AiOperationJob>, RepositoryError>;

    /// Persists `transition.job` only if storage still holds `expected_version`.
    /// Returns `false` when another writer moved the job first.
    async fn apply_transition(
        &self,
        job: &AiOperationJob,
        expected_version: u32,
        transition: JobTransitionEvent,
    ) -> Result<bool, RepositoryError>;

    /// Refreshes the claim of `worker_id` on a running job and records the
    /// attempt number. Returns `false` once the worker no longer owns the claim.
    async fn renew_claim(
        &self,
        id: &JobId,
        worker_id: &str,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Flags a running job for cancellation. Returns `false` if it is not running.
    async fn request_cancel(&self, id: &JobId, now: DateTime<Utc>)
        -> Result<bool, RepositoryError>;

    async fn list_transitions(
        &self,
        id: &JobId,
    ) -> Result<Vec<JobTransitionEvent>, RepositoryError>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<(), RepositoryError>;

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, RepositoryError>;

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<UsageRecord>, RepositoryError>;

    async fn summarize(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        user_id: Option<&UserId>,
    ) -> Result<UsageSummary, RepositoryError>;

    /// Deletes records older than `cutoff`; returns how many were removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
