//! Request Dispatcher: admits an AI operation and hands it to the worker pool.
//!
//! `dispatch` resolves model and template, reserves quota, persists a
//! `queued` job and enqueues its id. It never waits for the provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use noteflow_core::config::AppConfig;
use noteflow_core::domain::job::{
    AiOperationJob, JobId, JobStatus, JobTransitionEvent, TargetEntity,
};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::quota::{QuotaState, ReservationId, UserId};
use noteflow_core::domain::usage::UsageRecord;
use noteflow_core::errors::{ApplicationError, DispatchError};
use noteflow_core::job_engine::{hash_input, CancelOutcome, JobEngine, JobEngineConfig, NewJob};
use noteflow_core::quota::{estimate_tokens, QuotaDefaults};
use noteflow_core::registry::ProviderRegistry;
use noteflow_core::templates::{default_params, TemplateStore};
use noteflow_db::{JobInsert, JobRepository, LedgerError, QuotaLedger, UsageRepository};

use crate::llm::CompletionClient;
use crate::writer::EntityWriter;

const CANCEL_ATTEMPTS: usize = 3;

/// Shared collaborators of the dispatcher and the worker pool.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<RwLock<ProviderRegistry>>,
    pub templates: Arc<RwLock<TemplateStore>>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub jobs: Arc<dyn JobRepository>,
    pub usage: Arc<dyn UsageRepository>,
    pub client: Arc<dyn CompletionClient>,
    pub writer: Arc<dyn EntityWriter>,
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub engine: JobEngineConfig,
    pub quota_defaults: QuotaDefaults,
    pub token_estimate_factor: f64,
    pub idempotency_window: Duration,
    pub attempt_timeout: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub recovery_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            engine: config.dispatch.engine_config(),
            quota_defaults: config.quota.defaults(),
            token_estimate_factor: config.dispatch.token_estimate_factor,
            idempotency_window: Duration::from_secs(config.dispatch.idempotency_window_secs),
            attempt_timeout: Duration::from_secs(config.dispatch.attempt_timeout_secs),
            worker_count: config.dispatch.worker_count.max(1),
            queue_capacity: config.dispatch.queue_capacity.max(1),
            recovery_interval: Duration::from_secs(config.dispatch.recovery_interval_secs.max(1)),
        }
    }
}

/// Receiving end of the job queue, consumed by [`crate::worker::JobWorker::start`].
pub struct JobQueue {
    pub(crate) receiver: mpsc::Receiver<JobId>,
}

pub struct Dispatcher {
    services: Services,
    settings: DispatchSettings,
    engine: JobEngine,
    queue: mpsc::Sender<JobId>,
}

impl Dispatcher {
    pub fn new(services: Services, settings: DispatchSettings) -> (Self, JobQueue) {
        let (queue, receiver) = mpsc::channel(settings.queue_capacity);
        let engine = JobEngine::with_config(settings.engine.clone());
        (Self { services, settings, engine, queue }, JobQueue { receiver })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub(crate) fn queue_sender(&self) -> mpsc::Sender<JobId> {
        self.queue.clone()
    }

    /// Admits one operation and returns its job without waiting for execution.
    ///
    /// A non-terminal job for the same target and operation, or a job that
    /// succeeded on the same input within the idempotency window, is returned
    /// instead of creating a new one.
    pub async fn dispatch(
        &self,
        user_id: &UserId,
        target: TargetEntity,
        operation: OperationType,
        input_text: &str,
    ) -> Result<AiOperationJob, ApplicationError> {
        validate_request(user_id, &target, input_text)?;
        let now = Utc::now();

        if let Some(existing) = self.services.jobs.find_active_for_target(&target, operation).await? {
            debug!(
                event_name = "ai.dispatch.deduplicated",
                job_id = %existing.id,
                target = %target,
                "returning in-flight job"
            );
            return Ok(existing);
        }

        let input_hash = hash_input(operation, input_text);
        let since = now - chrono::Duration::from_std(self.settings.idempotency_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        if let Some(recent) = self
            .services
            .jobs
            .find_recent_success(&target, operation, &input_hash, since)
            .await?
        {
            debug!(
                event_name = "ai.dispatch.reused",
                job_id = %recent.id,
                target = %target,
                "returning recent result for identical input"
            );
            return Ok(recent);
        }

        let selection = self.services.registry.read().await.active_model(operation)?;

        let mut params = default_params(operation);
        params.insert("content".to_string(), input_text.to_string());
        let request = self.services.templates.read().await.render(operation, &params)?;

        let estimated_tokens = estimate_tokens(
            &format!("{} {}", request.system_message, request.prompt),
            self.settings.token_estimate_factor,
            request.max_tokens,
        );

        let reservation = self
            .services
            .ledger
            .check_and_reserve(user_id, estimated_tokens, self.settings.quota_defaults, now)
            .await
            .map_err(|error| {
                if let LedgerError::Rejected(DispatchError::QuotaExceeded { .. }) = &error {
                    info!(
                        event_name = "ai.quota.exceeded",
                        user_id = %user_id.0,
                        estimated_tokens,
                        "dispatch rejected by quota"
                    );
                }
                ApplicationError::from(error)
            })?;

        let created = self.engine.create_job(
            NewJob {
                user_id: user_id.clone(),
                target,
                operation,
                input_text: input_text.to_string(),
                provider_id: selection.provider.id.clone(),
                model_id: selection.model.id.clone(),
                request,
                reservation_id: reservation.id.clone(),
                estimated_tokens,
            },
            now,
        );

        let inserted = self.services.jobs.insert_job(created.job.clone(), created.transition).await;
        let job = match inserted {
            Ok(JobInsert::Created) => created.job,
            Ok(JobInsert::Conflict(winner)) => {
                self.release_quietly(&reservation.id).await;
                debug!(
                    event_name = "ai.dispatch.deduplicated",
                    job_id = %winner.id,
                    "concurrent dispatch won the target slot"
                );
                return Ok(winner);
            }
            Err(error) => {
                self.release_quietly(&reservation.id).await;
                return Err(error.into());
            }
        };

        enqueue(&self.queue, &job.id);
        info!(
            event_name = "ai.job.enqueued",
            job_id = %job.id,
            user_id = %job.user_id.0,
            operation = job.operation.as_str(),
            model_id = %job.model_id.0,
            estimated_tokens = job.estimated_tokens,
            "ai job enqueued"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<AiOperationJob, ApplicationError> {
        self.services
            .jobs
            .find_job(id)
            .await?
            .ok_or_else(|| DispatchError::JobNotFound(id.0.clone()).into())
    }

    pub async fn list_jobs_for_target(
        &self,
        target: &TargetEntity,
    ) -> Result<Vec<AiOperationJob>, ApplicationError> {
        Ok(self.services.jobs.list_jobs_for_target(target).await?)
    }

    pub async fn list_transitions(
        &self,
        id: &JobId,
    ) -> Result<Vec<JobTransitionEvent>, ApplicationError> {
        Ok(self.services.jobs.list_transitions(id).await?)
    }

    pub async fn get_quota_state(&self, user_id: &UserId) -> Result<QuotaState, ApplicationError> {
        Ok(self
            .services
            .ledger
            .get_quota_state(user_id, self.settings.quota_defaults, Utc::now())
            .await?)
    }

    pub async fn set_quota_limits(
        &self,
        user_id: &UserId,
        max_requests: u32,
        max_tokens: u32,
    ) -> Result<QuotaState, ApplicationError> {
        let state = self
            .services
            .ledger
            .set_limits(user_id, max_requests, max_tokens, self.settings.quota_defaults, Utc::now())
            .await?;
        info!(
            event_name = "ai.quota.limits_updated",
            user_id = %user_id.0,
            max_requests,
            max_tokens,
            "quota limits updated"
        );
        Ok(state)
    }

    pub async fn recent_usage(
        &self,
        user_id: &UserId,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, ApplicationError> {
        Ok(self.services.usage.list_for_user(user_id, limit).await?)
    }

    /// Cancels a queued job outright or flags a running one. Terminal jobs
    /// are rejected with `InvalidTransition`.
    pub async fn cancel(&self, id: &JobId) -> Result<AiOperationJob, ApplicationError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.get_job(id).await?;
            let expected_version = job.state_version;
            let reservation_id = job.reservation_id.clone();
            let now = Utc::now();

            match self.engine.cancel(job, now)? {
                CancelOutcome::Cancelled(cancelled) => {
                    if self
                        .services
                        .jobs
                        .apply_transition(&cancelled.job, expected_version, cancelled.transition)
                        .await?
                    {
                        if let Some(reservation_id) = reservation_id {
                            self.release_quietly(&reservation_id).await;
                        }
                        info!(
                            event_name = "ai.job.cancelled",
                            job_id = %id,
                            "queued job cancelled before execution"
                        );
                        return Ok(cancelled.job);
                    }
                }
                CancelOutcome::Requested(flagged) => {
                    if self.services.jobs.request_cancel(id, now).await? {
                        info!(
                            event_name = "ai.job.cancel_requested",
                            job_id = %id,
                            "running job flagged for cancellation"
                        );
                        return Ok(flagged);
                    }
                }
            }
            debug!(event_name = "ai.job.cancel_retry", job_id = %id, "job moved during cancel");
        }

        let job = self.get_job(id).await?;
        Err(DispatchError::InvalidTransition {
            from: job.status,
            to: JobStatus::Failed,
            reason: "job kept changing state while cancelling".to_string(),
        }
        .into())
    }

    async fn release_quietly(&self, reservation_id: &ReservationId) {
        if let Err(error) = self.services.ledger.release(reservation_id, Utc::now()).await {
            warn!(
                event_name = "ai.quota.release_failed",
                reservation_id = %reservation_id.0,
                error = %error,
                "failed to release reservation"
            );
        }
    }
}

/// Enqueue without waiting. A full queue leaves the job `queued` in storage,
/// where the recovery sweep picks it up.
pub(crate) fn enqueue(queue: &mpsc::Sender<JobId>, id: &JobId) -> bool {
    match queue.try_send(id.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(event_name = "ai.queue.full", job_id = %id, "job queue full, deferring to recovery");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(event_name = "ai.queue.closed", job_id = %id, "job queue closed");
            false
        }
    }
}

fn validate_request(
    user_id: &UserId,
    target: &TargetEntity,
    input_text: &str,
) -> Result<(), DispatchError> {
    if user_id.0.trim().is_empty() {
        return Err(DispatchError::InvalidInput("user id must not be empty".to_string()));
    }
    if target.id.trim().is_empty() {
        return Err(DispatchError::InvalidInput("target id must not be empty".to_string()));
    }
    if input_text.trim().is_empty() {
        return Err(DispatchError::InvalidInput("input text must not be empty".to_string()));
    }
    Ok(())
}
