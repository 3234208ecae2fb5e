//! Task Queue worker pool.
//!
//! Consumes job ids from the dispatcher's queue, claims each job with a
//! compare-and-set and runs its attempts under a semaphore-bounded pool.
//! The claim is renewed while attempts and backoff waits are in flight.
//! A periodic recovery sweep re-enqueues `queued` jobs and returns jobs with
//! expired claims to the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use noteflow_core::domain::job::{
    AiOperationJob, JobError, JobErrorKind, JobId, JobStatus, JobTransitionEvent, OperationResult,
};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::usage::{UsageOutcome, UsageRecord, UsageRecordId};
use noteflow_core::errors::DispatchError;
use noteflow_core::job_engine::{AttemptFailure, JobEngine, RetryBudget, RetryDecision};
use noteflow_core::rate_limit::ProviderRateLimiter;
use noteflow_core::results::parse_completion;
use noteflow_db::LedgerError;

use crate::dispatcher::{enqueue, DispatchSettings, Dispatcher, JobQueue, Services};
use crate::llm::{Completion, CompletionRequest, ProviderError};

const EVENT_CAPACITY: usize = 256;

/// Notifications emitted as jobs move through the pool.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    WorkerStarted,
    JobStarted { job_id: JobId, operation: OperationType },
    JobRetrying { job_id: JobId, attempt: u32, delay: Duration },
    JobSucceeded { job_id: JobId, operation: OperationType, attempts: u32 },
    JobFailed { job_id: JobId, operation: OperationType, kind: JobErrorKind },
    JobCancelled { job_id: JobId },
    WorkerStopped,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker already stopped")]
    AlreadyStopped,
    #[error("worker task failed: {0}")]
    Join(String),
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops taking new jobs and waits for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.shutdown_tx.send(()).await.map_err(|_| WorkerError::AlreadyStopped)?;
        self.task.await.map_err(|error| WorkerError::Join(error.to_string()))
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

struct WorkerShared {
    services: Services,
    settings: DispatchSettings,
    engine: JobEngine,
    worker_id: String,
    queue: mpsc::Sender<JobId>,
    events: broadcast::Sender<WorkerEvent>,
    limiter: Mutex<ProviderRateLimiter>,
}

pub struct JobWorker {
    shared: Arc<WorkerShared>,
}

impl JobWorker {
    pub fn new(dispatcher: &Dispatcher) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let settings = dispatcher.settings().clone();
        Self {
            shared: Arc::new(WorkerShared {
                services: dispatcher.services().clone(),
                engine: JobEngine::with_config(settings.engine.clone()),
                settings,
                worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
                queue: dispatcher.queue_sender(),
                events,
                limiter: Mutex::new(ProviderRateLimiter::new()),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn start(self, queue: JobQueue) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.shared.events.subscribe();
        let shared = Arc::clone(&self.shared);

        let task = tokio::spawn(async move {
            shared.run(queue.receiver, shutdown_rx).await;
        });

        WorkerHandle { shutdown_tx, event_rx, task }
    }
}

impl WorkerShared {
    #[instrument(skip_all, fields(worker_id = %self.worker_id))]
    async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<JobId>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!(
            event_name = "system.worker.started",
            worker_count = self.settings.worker_count,
            "job worker started"
        );
        self.emit(WorkerEvent::WorkerStarted);

        let permits = Arc::new(Semaphore::new(self.settings.worker_count));
        let mut tasks = JoinSet::new();
        let mut recovery = tokio::time::interval(self.settings.recovery_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(event_name = "system.worker.shutdown_requested", "job worker shutting down");
                    break;
                }
                _ = recovery.tick() => {
                    self.recover().await;
                }
                next = queue.recv() => {
                    let Some(job_id) = next else {
                        break;
                    };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break;
                    };
                    let shared = Arc::clone(&self);
                    tasks.spawn(async move {
                        shared.execute(job_id).await;
                        drop(permit);
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(join_error) = joined {
                        error!(event_name = "system.worker.task_panicked", error = %join_error, "job task panicked");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(join_error) = joined {
                error!(event_name = "system.worker.task_panicked", error = %join_error, "job task panicked");
            }
        }

        info!(event_name = "system.worker.stopped", "job worker stopped");
        self.emit(WorkerEvent::WorkerStopped);
    }

    /// Re-enqueues queued jobs and requeues running jobs whose claim expired.
    async fn recover(&self) {
        let jobs = &self.services.jobs;
        let now = Utc::now();

        match jobs.list_jobs_by_status(JobStatus::Running).await {
            Ok(running) => {
                for stale in self.engine.stale_jobs(running, now) {
                    let expected_version = stale.state_version;
                    let Ok(requeued) = self.engine.requeue_stale(stale, now) else {
                        continue;
                    };
                    match jobs
                        .apply_transition(&requeued.job, expected_version, requeued.transition)
                        .await
                    {
                        Ok(true) => info!(
                            event_name = "ai.job.requeued",
                            job_id = %requeued.job.id,
                            "stale claim returned to queue"
                        ),
                        Ok(false) => {}
                        Err(error) => warn!(
                            event_name = "ai.job.requeue_failed",
                            job_id = %requeued.job.id,
                            error = %error,
                            "failed to requeue stale job"
                        ),
                    }
                }
            }
            Err(error) => {
                warn!(event_name = "ai.recovery.failed", error = %error, "failed to list running jobs");
            }
        }

        match jobs.list_jobs_by_status(JobStatus::Queued).await {
            Ok(queued) => {
                let mut enqueued = 0usize;
                for job in &queued {
                    if !enqueue(&self.queue, &job.id) {
                        break;
                    }
                    enqueued += 1;
                }
                if enqueued > 0 {
                    debug!(event_name = "ai.recovery.enqueued", enqueued, "queued jobs re-enqueued");
                }
            }
            Err(error) => {
                warn!(event_name = "ai.recovery.failed", error = %error, "failed to list queued jobs");
            }
        }
    }

    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    async fn execute(&self, job_id: JobId) {
        let job = match self.services.jobs.find_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(event_name = "ai.job.missing", job_id = %job_id, "queued job not found");
                return;
            }
            Err(error) => {
                warn!(event_name = "ai.job.load_failed", job_id = %job_id, error = %error, "failed to load job");
                return;
            }
        };
        if job.status.is_terminal() {
            return;
        }

        let expected_version = job.state_version;
        let claimed = match self.engine.claim(job, &self.worker_id, Utc::now()) {
            Ok(claimed) => claimed,
            Err(reason) => {
                debug!(event_name = "ai.job.claim_skipped", job_id = %job_id, reason = %reason, "job not claimable");
                return;
            }
        };
        match self
            .services
            .jobs
            .apply_transition(&claimed.job, expected_version, claimed.transition)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(event_name = "ai.job.claim_lost", job_id = %job_id, "another worker claimed the job");
                return;
            }
            Err(error) => {
                warn!(event_name = "ai.job.claim_failed", job_id = %job_id, error = %error, "failed to persist claim");
                return;
            }
        }

        let job = claimed.job;
        info!(
            event_name = "ai.job.started",
            job_id = %job.id,
            operation = job.operation.as_str(),
            "ai job started"
        );
        self.emit(WorkerEvent::JobStarted { job_id: job.id.clone(), operation: job.operation });

        self.run_attempts(job).await;
    }

    async fn run_attempts(&self, mut job: AiOperationJob) {
        let request = match self.completion_request(&job).await {
            Ok(request) => request,
            Err(message) => {
                let error = JobError { kind: JobErrorKind::ProviderUnavailable, message };
                self.give_up(job, error, 0).await;
                return;
            }
        };
        let mut budget = RetryBudget::default();

        loop {
            if self.with_heartbeat(&job, self.wait_for_rate_slot(&job)).await.is_none() {
                return;
            }

            job.attempt_count += 1;
            if !self.holds_claim(&job).await {
                return;
            }

            let started = Instant::now();
            let call =
                tokio::time::timeout(self.settings.attempt_timeout, self.services.client.complete(&request));
            let Some(outcome) = self.with_heartbeat(&job, call).await else {
                return;
            };
            let outcome =
                outcome.unwrap_or(Err(ProviderError::Timeout(self.settings.attempt_timeout)));
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let failure = match outcome {
                Ok(completion) => match parse_completion(job.operation, &completion.text, None) {
                    Ok(result) => {
                        self.succeed(job, completion, result, latency_ms).await;
                        return;
                    }
                    Err(parse_failure) => {
                        AttemptFailure::InvalidResponse { message: parse_failure.to_string() }
                    }
                },
                Err(provider_error) => provider_error.into_attempt_failure(),
            };

            if let Ok(Some(stored)) = self.services.jobs.find_job(&job.id).await {
                job.cancel_requested |= stored.cancel_requested;
            }

            match self.engine.decide_retry(&job, &budget, &failure) {
                RetryDecision::RetryAfter(delay) => {
                    budget.record(&failure);
                    warn!(
                        event_name = "ai.job.attempt_failed",
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        error_kind = failure.kind().as_str(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = failure.message(),
                        "attempt failed, retrying"
                    );
                    self.emit(WorkerEvent::JobRetrying {
                        job_id: job.id.clone(),
                        attempt: job.attempt_count,
                        delay,
                    });
                    if self.with_heartbeat(&job, tokio::time::sleep(delay)).await.is_none() {
                        return;
                    }
                }
                RetryDecision::GiveUp(error) => {
                    self.give_up(job, error, latency_ms).await;
                    return;
                }
            }
        }
    }

    async fn completion_request(&self, job: &AiOperationJob) -> Result<CompletionRequest, String> {
        let registry = self.services.registry.read().await;
        let provider = registry
            .provider(&job.provider_id)
            .ok_or_else(|| format!("provider `{}` is no longer registered", job.provider_id.0))?;
        Ok(CompletionRequest {
            base_url: provider.base_url.clone(),
            model: job.model_id.clone(),
            prompt: job.request.clone(),
        })
    }

    /// Waiting here does not count as an attempt.
    async fn wait_for_rate_slot(&self, job: &AiOperationJob) {
        let requests_per_minute = self
            .services
            .registry
            .read()
            .await
            .provider(&job.provider_id)
            .map_or(0, |provider| provider.requests_per_minute);

        loop {
            let wait = self.limiter.lock().await.try_acquire(
                &job.provider_id,
                requests_per_minute,
                Instant::now(),
            );
            match wait {
                Ok(()) => return,
                Err(delay) => {
                    debug!(
                        event_name = "ai.provider.rate_wait",
                        provider_id = %job.provider_id.0,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "waiting for provider rate slot"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drives `work` while renewing the claim every third of the claim
    /// timeout. Returns `None`, dropping `work`, once the claim is lost.
    async fn with_heartbeat<F: Future>(&self, job: &AiOperationJob, work: F) -> Option<F::Output> {
        let period = (self.engine.config().claim_timeout / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                _ = heartbeat.tick() => {
                    if !self.holds_claim(job).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Refreshes this worker's claim and records the attempt count. A claim
    /// lost to recovery means another execution unit now owns the job.
    async fn holds_claim(&self, job: &AiOperationJob) -> bool {
        match self
            .services
            .jobs
            .renew_claim(&job.id, &self.worker_id, job.attempt_count, Utc::now())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    event_name = "ai.job.claim_lost",
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    "claim no longer held, abandoning execution"
                );
                false
            }
            Err(error) => {
                warn!(event_name = "ai.job.claim_renew_failed", job_id = %job.id, error = %error, "failed to renew claim");
                true
            }
        }
    }

    /// Commits before anything else; the reservation is consumed exactly once.
    async fn succeed(
        &self,
        mut job: AiOperationJob,
        completion: Completion,
        result: OperationResult,
        latency_ms: u64,
    ) {
        if !self.holds_claim(&job).await {
            return;
        }

        let now = Utc::now();
        let tokens_charged = match job.reservation_id.clone() {
            Some(reservation_id) => {
                match self.services.ledger.commit(&reservation_id, completion.total_tokens, now).await {
                    Ok(charged) => charged,
                    Err(error) => match self.adopt_settled(&job, &error).await {
                        Some(stored) => {
                            job = stored;
                            0
                        }
                        None => return,
                    },
                }
            }
            None => 0,
        };

        let cost = self
            .services
            .registry
            .read()
            .await
            .model(&job.model_id)
            .map_or(Decimal::ZERO, |model| model.cost_for(completion.total_tokens));

        self.append_usage(UsageRecord {
            id: new_usage_id(),
            user_id: job.user_id.clone(),
            model_id: job.model_id.clone(),
            operation: job.operation,
            job_id: job.id.clone(),
            tokens_consumed: completion.total_tokens,
            tokens_charged,
            cost,
            latency_ms,
            outcome: UsageOutcome::Success,
            error_kind: None,
            recorded_at: now,
        })
        .await;

        if let Err(error) =
            self.services.writer.write_result(&job.target, job.operation, &result).await
        {
            warn!(
                event_name = "ai.job.write_back_failed",
                job_id = %job.id,
                target = %job.target,
                error = %error,
                "result kept on job but entity write failed"
            );
        }

        let expected_version = job.state_version;
        let attempts = job.attempt_count;
        let operation = job.operation;
        let completed = match self.engine.complete(job, result, now) {
            Ok(completed) => completed,
            Err(error) => {
                warn!(event_name = "ai.job.transition_rejected", error = %error, "cannot complete job");
                return;
            }
        };
        let job_id = completed.job.id.clone();
        if self.persist_final(&completed.job, expected_version, completed.transition).await {
            info!(
                event_name = "ai.job.succeeded",
                job_id = %job_id,
                operation = operation.as_str(),
                attempts,
                tokens = completion.total_tokens,
                tokens_charged,
                cost = %cost,
                latency_ms,
                "ai job succeeded"
            );
            self.emit(WorkerEvent::JobSucceeded { job_id, operation, attempts });
        }
    }

    async fn give_up(&self, mut job: AiOperationJob, error: JobError, latency_ms: u64) {
        if !self.holds_claim(&job).await {
            return;
        }

        let now = Utc::now();
        if let Some(reservation_id) = job.reservation_id.clone() {
            if let Err(ledger_error) = self.services.ledger.release(&reservation_id, now).await {
                match self.adopt_settled(&job, &ledger_error).await {
                    Some(stored) => job = stored,
                    None => return,
                }
            }
        }

        self.append_usage(UsageRecord {
            id: new_usage_id(),
            user_id: job.user_id.clone(),
            model_id: job.model_id.clone(),
            operation: job.operation,
            job_id: job.id.clone(),
            tokens_consumed: 0,
            tokens_charged: 0,
            cost: Decimal::ZERO,
            latency_ms,
            outcome: UsageOutcome::Failure,
            error_kind: Some(error.kind),
            recorded_at: now,
        })
        .await;

        let expected_version = job.state_version;
        let operation = job.operation;
        let attempts = job.attempt_count;
        let kind = error.kind;
        let message = error.message.clone();
        let failed = match self.engine.fail(job, error, now) {
            Ok(failed) => failed,
            Err(transition_error) => {
                warn!(event_name = "ai.job.transition_rejected", error = %transition_error, "cannot fail job");
                return;
            }
        };
        let job_id = failed.job.id.clone();
        if !self.persist_final(&failed.job, expected_version, failed.transition).await {
            return;
        }

        if kind == JobErrorKind::Cancelled {
            info!(event_name = "ai.job.cancelled", job_id = %job_id, attempts, "running job cancelled");
            self.emit(WorkerEvent::JobCancelled { job_id });
        } else {
            warn!(
                event_name = "ai.job.failed",
                job_id = %job_id,
                operation = operation.as_str(),
                attempts,
                error_kind = kind.as_str(),
                error = %message,
                "ai job failed"
            );
            self.emit(WorkerEvent::JobFailed { job_id, operation, kind });
        }
    }

    /// A missing reservation means another execution unit of this job already
    /// settled it. Returns the stored job when it is still running so this
    /// unit writes the terminal state; otherwise the job is left to its owner
    /// or to recovery.
    async fn adopt_settled(
        &self,
        job: &AiOperationJob,
        error: &LedgerError,
    ) -> Option<AiOperationJob> {
        if !matches!(error, LedgerError::Rejected(DispatchError::ReservationNotFound(_))) {
            error!(
                event_name = "ai.quota.settlement_failed",
                job_id = %job.id,
                error = %error,
                "failed to settle reservation, leaving job for recovery"
            );
            return None;
        }

        match self.services.jobs.find_job(&job.id).await {
            Ok(Some(mut stored)) if stored.status == JobStatus::Running => {
                info!(
                    event_name = "ai.job.settled_elsewhere",
                    job_id = %job.id,
                    "reservation already settled, finishing job"
                );
                stored.attempt_count = stored.attempt_count.max(job.attempt_count);
                stored.cancel_requested |= job.cancel_requested;
                Some(stored)
            }
            Ok(_) => {
                debug!(
                    event_name = "ai.job.settlement_skipped",
                    job_id = %job.id,
                    "reservation settled and job no longer running"
                );
                None
            }
            Err(load_error) => {
                warn!(event_name = "ai.job.load_failed", job_id = %job.id, error = %load_error, "failed to reload job");
                None
            }
        }
    }

    async fn append_usage(&self, record: UsageRecord) {
        let job_id = record.job_id.clone();
        if let Err(error) = self.services.usage.append(record).await {
            error!(event_name = "ai.usage.append_failed", job_id = %job_id, error = %error, "failed to record usage");
        }
    }

    async fn persist_final(
        &self,
        job: &AiOperationJob,
        expected_version: u32,
        transition: JobTransitionEvent,
    ) -> bool {
        match self.services.jobs.apply_transition(job, expected_version, transition).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(event_name = "ai.job.transition_conflict", job_id = %job.id, "job changed underneath worker");
                false
            }
            Err(error) => {
                error!(event_name = "ai.job.transition_failed", job_id = %job.id, error = %error, "failed to persist job outcome");
                false
            }
        }
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}

fn new_usage_id() -> UsageRecordId {
    UsageRecordId(format!("usage-{}", uuid::Uuid::new_v4()))
}
