use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use noteflow_core::domain::job::{
    AiOperationJob, JobId, JobStatus, JobTransitionEvent, TargetEntity,
};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::quota::{QuotaReservation, QuotaState, ReservationId, UserId};
use noteflow_core::domain::usage::{UsageRecord, UsageSummary};
use noteflow_core::errors::DispatchError;
use noteflow_core::quota::{self as rules, QuotaDefaults};

use super::{
    JobInsert, JobRepository, LedgerError, QuotaLedger, RepositoryError, UsageRepository,
};

#[derive(Default)]
struct LedgerState {
    quotas: HashMap<String, QuotaState>,
    reservations: HashMap<String, QuotaReservation>,
}

impl LedgerState {
    fn current(
        &mut self,
        user_id: &UserId,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> &mut QuotaState {
        let state = self
            .quotas
            .entry(user_id.0.clone())
            .or_insert_with(|| rules::new_quota_state(user_id.clone(), defaults, now));
        rules::reset_if_due(state, now);
        state
    }
}

#[derive(Default)]
pub struct InMemoryQuotaLedger {
    state: RwLock<LedgerState>,
}

#[async_trait::async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn get_quota_state(
        &self,
        user_id: &UserId,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError> {
        let mut ledger = self.state.write().await;
        Ok(ledger.current(user_id, defaults, now).clone())
    }

    async fn check_and_reserve(
        &self,
        user_id: &UserId,
        estimated_tokens: u32,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaReservation, LedgerError> {
        let mut ledger = self.state.write().await;
        rules::reserve(ledger.current(user_id, defaults, now), estimated_tokens, now)?;

        let reservation = QuotaReservation {
            id: ReservationId(format!("res-{}", uuid::Uuid::new_v4())),
            user_id: user_id.clone(),
            estimated_tokens,
            created_at: now,
        };
        ledger.reservations.insert(reservation.id.0.clone(), reservation.clone());
        Ok(reservation)
    }

    async fn commit(
        &self,
        reservation_id: &ReservationId,
        actual_tokens: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, LedgerError> {
        let mut ledger = self.state.write().await;
        let reservation = ledger
            .reservations
            .remove(&reservation_id.0)
            .ok_or_else(|| DispatchError::ReservationNotFound(reservation_id.0.clone()))?;

        let charged = match ledger.quotas.get_mut(&reservation.user_id.0) {
            Some(state) => rules::commit(state, reservation.estimated_tokens, actual_tokens, now),
            None => rules::charged_tokens(reservation.estimated_tokens, actual_tokens),
        };
        Ok(charged)
    }

    async fn release(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut ledger = self.state.write().await;
        let reservation = ledger
            .reservations
            .remove(&reservation_id.0)
            .ok_or_else(|| DispatchError::ReservationNotFound(reservation_id.0.clone()))?;

        if let Some(state) = ledger.quotas.get_mut(&reservation.user_id.0) {
            rules::release(state, reservation.estimated_tokens, now);
        }
        Ok(())
    }

    async fn set_limits(
        &self,
        user_id: &UserId,
        max_requests: u32,
        max_tokens: u32,
        defaults: QuotaDefaults,
        now: DateTime<Utc>,
    ) -> Result<QuotaState, LedgerError> {
        let mut ledger = self.state.write().await;
        let state = ledger.current(user_id, defaults, now);
        state.max_requests = max_requests;
        state.max_tokens = max_tokens;
        state.updated_at = now;
        Ok(state.clone())
    }

    async fn reset_due(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut ledger = self.state.write().await;
        let reset = ledger.quotas.values_mut().map(|state| rules::reset_if_due(state, now)).filter(|reset| *reset).count();
        Ok(reset as u64)
    }

    async fn outstanding_reservations(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<QuotaReservation>, LedgerError> {
        let ledger = self.state.read().await;
        let mut reservations: Vec<_> = ledger
            .reservations
            .values()
            .filter(|reservation| &reservation.user_id == user_id)
            .cloned()
            .collect();
        reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(reservations)
    }
}

#[derive(Default)]
struct JobStore {
    jobs: HashMap<String, AiOperationJob>,
    transitions: Vec<JobTransitionEvent>,
}

impl JobStore {
    fn active_for(&self, target: &TargetEntity, operation: OperationType) -> Option<&AiOperationJob> {
        self.jobs.values().find(|job| {
            &job.target == target && job.operation == operation && !job.status.is_terminal()
        })
    }
}

fn sorted_by_creation(mut jobs: Vec<AiOperationJob>) -> Vec<AiOperationJob> {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
    jobs
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    store: RwLock<JobStore>,
}

#[async_trait::async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert_job(
        &self,
        job: AiOperationJob,
        transition: JobTransitionEvent,
    ) -> Result<JobInsert, RepositoryError> {
        let mut store = self.store.write().await;
        if let Some(existing) = store.active_for(&job.target, job.operation) {
            return Ok(JobInsert::Conflict(existing.clone()));
        }
        if store.jobs.contains_key(&job.id.0) {
            return Err(RepositoryError::Decode(format!(
                "job `{}` collided with an existing row",
                job.id
            )));
        }

        store.jobs.insert(job.id.0.clone(), job);
        store.transitions.push(transition);
        Ok(JobInsert::Created)
    }

    async fn find_job(&self, id: &JobId) -> Result<Option<AiOperationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.jobs.get(&id.0).cloned())
    }

    async fn find_active_for_target(
        &self,
        target: &TargetEntity,
        operation: OperationType,
    ) -> Result<Option<AiOperationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.active_for(target, operation).cloned())
    }

    async fn find_recent_success(
        &self,
        target: &TargetEntity,
        operation: OperationType,
        input_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AiOperationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store
            .jobs
            .values()
            .filter(|job| {
                &job.target == target
                    && job.operation == operation
                    && job.input_hash == input_hash
                    && job.status == JobStatus::Succeeded
                    && job.finished_at.is_some_and(|finished| finished >= since)
            })
            .max_by_key(|job| job.finished_at)
            .cloned())
    }

    async fn list_jobs_for_target(
        &self,
        target: &TargetEntity,
    ) -> Result<Vec<AiOperationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(sorted_by_creation(
            store.jobs.values().filter(|job| &job.target == target).cloned().collect(),
        ))
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
    ) -> Result<Vec<AiOperationJob>, RepositoryError> {
        let store = self.store.read().await;
        Ok(sorted_by_creation(
            store.jobs.values().filter(|job| job.status == status).cloned().collect(),
        ))
    }

    async fn apply_transition(
        &self,
        job: &AiOperationJob,
        expected_version: u32,
        transition: JobTransitionEvent,
    ) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        let Some(stored) = store.jobs.get_mut(&job.id.0) else {
            return Ok(false);
        };
        if stored.state_version != expected_version {
            return Ok(false);
        }

        let cancel_requested = stored.cancel_requested || job.cancel_requested;
        let attempt_count = stored.attempt_count.max(job.attempt_count);
        *stored = job.clone();
        stored.cancel_requested = cancel_requested;
        stored.attempt_count = attempt_count;
        store.transitions.push(transition);
        Ok(true)
    }

    async fn renew_claim(
        &self,
        id: &JobId,
        worker_id: &str,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        match store.jobs.get_mut(&id.0) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.claimed_by.as_deref() == Some(worker_id) =>
            {
                job.attempt_count = job.attempt_count.max(attempt_count);
                job.claimed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut store = self.store.write().await;
        match store.jobs.get_mut(&id.0) {
            Some(job) if job.status == JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_transitions(
        &self,
        id: &JobId,
    ) -> Result<Vec<JobTransitionEvent>, RepositoryError> {
        let store = self.store.read().await;
        Ok(store.transitions.iter().filter(|event| &event.job_id == id).cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryUsageRepository {
    records: RwLock<Vec<UsageRecord>>,
}

#[async_trait::async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn append(&self, record: UsageRecord) -> Result<(), RepositoryError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<_> =
            records.iter().filter(|record| &record.user_id == user_id).cloned().collect();
        matching.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn list_for_job(&self, job_id: &JobId) -> Result<Vec<UsageRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|record| &record.job_id == job_id).cloned().collect())
    }

    async fn summarize(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        user_id: Option<&UserId>,
    ) -> Result<UsageSummary, RepositoryError> {
        let records = self.records.read().await;
        Ok(UsageSummary::from_records(records.iter().filter(|record| {
            record.recorded_at >= since
                && record.recorded_at < until
                && user_id.map_or(true, |user| &record.user_id == user)
        })))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|record| record.recorded_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
