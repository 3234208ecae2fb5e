//! Deterministic AI job state machine
//!
//! Owns every status transition of an [`AiOperationJob`] and the retry
//! policy applied between attempts. Each transition yields an audit event
//! so storage can persist the new state and its history together.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::job::{
    AiOperationJob, JobError, JobErrorKind, JobId, JobStatus, JobTransitionEvent, JobTransitionId,
    OperationResult, TargetEntity,
};
use crate::domain::operation::OperationType;
use crate::domain::provider::{ModelId, ProviderId};
use crate::domain::quota::{ReservationId, UserId};
use crate::domain::template::RenderedPrompt;
use crate::errors::DispatchError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobEngineConfig {
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Retries granted to unparseable or empty completions.
    pub invalid_response_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How long a running claim lives before the job is handed to another worker.
    pub claim_timeout: Duration,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            invalid_response_retries: 1,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(900),
        }
    }
}

/// Everything the dispatcher resolved before a job exists.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJob {
    pub user_id: UserId,
    pub target: TargetEntity,
    pub operation: OperationType,
    pub input_text: String,
    pub provider_id: ProviderId,
    pub model_id: ModelId,
    pub request: RenderedPrompt,
    pub reservation_id: ReservationId,
    pub estimated_tokens: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransitionResult {
    pub job: AiOperationJob,
    pub transition: JobTransitionEvent,
}

/// How a single provider attempt went wrong.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Provider unreachable, 5xx, or attempt timeout.
    Unavailable { message: String },
    RateLimited { message: String, retry_after: Option<Duration> },
    InvalidResponse { message: String },
    /// Authentication or request rejected by the provider.
    Rejected { message: String },
}

impl AttemptFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Unavailable { message }
            | Self::RateLimited { message, .. }
            | Self::InvalidResponse { message }
            | Self::Rejected { message } => message,
        }
    }

    pub fn kind(&self) -> JobErrorKind {
        match self {
            Self::Unavailable { .. } | Self::Rejected { .. } => JobErrorKind::ProviderUnavailable,
            Self::RateLimited { .. } => JobErrorKind::RateLimited,
            Self::InvalidResponse { .. } => JobErrorKind::InvalidResponse,
        }
    }
}

/// Retries already spent by one execution unit. Transient and invalid
/// response retries draw on separate allowances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryBudget {
    pub retries_used: u32,
    pub invalid_response_retries_used: u32,
}

impl RetryBudget {
    /// Charges a granted retry to the allowance `failure` draws on.
    pub fn record(&mut self, failure: &AttemptFailure) {
        match failure {
            AttemptFailure::InvalidResponse { .. } => self.invalid_response_retries_used += 1,
            _ => self.retries_used += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(JobError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CancelOutcome {
    /// Queued job failed with `Cancelled`; its reservation must be released.
    Cancelled(TransitionResult),
    /// Running job flagged; the worker finishes the current attempt.
    Requested(AiOperationJob),
}

#[derive(Clone, Debug, Default)]
pub struct JobEngine {
    config: JobEngineConfig,
}

impl JobEngine {
    pub fn new() -> Self {
        Self::with_config(JobEngineConfig::default())
    }

    pub fn with_config(config: JobEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    pub fn create_job(&self, new_job: NewJob, now: DateTime<Utc>) -> TransitionResult {
        let job = AiOperationJob {
            id: JobId(Uuid::new_v4().to_string()),
            input_hash: hash_input(new_job.operation, &new_job.input_text),
            user_id: new_job.user_id,
            target: new_job.target,
            operation: new_job.operation,
            input_text: new_job.input_text,
            provider_id: new_job.provider_id,
            model_id: new_job.model_id,
            request: new_job.request,
            reservation_id: Some(new_job.reservation_id),
            estimated_tokens: new_job.estimated_tokens,
            status: JobStatus::Queued,
            result: None,
            error: None,
            attempt_count: 0,
            max_retries: self.config.max_retries,
            cancel_requested: false,
            claimed_by: None,
            claimed_at: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };

        let transition = self.transition_event(
            &job,
            None,
            "job_enqueued",
            None,
            serde_json::json!({
                "operation": job.operation.as_str(),
                "model_id": job.model_id.0,
                "estimated_tokens": job.estimated_tokens,
            }),
            "dispatcher",
            now,
        );
        TransitionResult { job, transition }
    }

    /// Queued -> Running. A running job whose claim has expired may be stolen.
    pub fn claim(
        &self,
        mut job: AiOperationJob,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DispatchError> {
        match job.status {
            JobStatus::Queued => {}
            JobStatus::Running if self.claim_expired(&job, now) => {}
            JobStatus::Running => {
                return Err(DispatchError::InvalidTransition {
                    from: JobStatus::Running,
                    to: JobStatus::Running,
                    reason: format!(
                        "job already claimed by {}",
                        job.claimed_by.clone().unwrap_or_default()
                    ),
                });
            }
            JobStatus::Succeeded | JobStatus::Failed => {
                return Err(DispatchError::InvalidTransition {
                    from: job.status,
                    to: JobStatus::Running,
                    reason: "job already in terminal state".to_string(),
                });
            }
        }

        let from = job.status;
        job.status = JobStatus::Running;
        job.claimed_by = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.started_at.get_or_insert(now);
        job.state_version += 1;
        job.updated_at = now;

        let transition = self.transition_event(
            &job,
            Some(from),
            "job_claimed",
            None,
            serde_json::json!({
                "worker_id": worker_id,
                "claim_timeout_secs": self.config.claim_timeout.as_secs(),
            }),
            worker_id,
            now,
        );
        Ok(TransitionResult { job, transition })
    }

    /// Delay before retry number `retry_index` (zero based).
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_index).unwrap_or(u32::MAX);
        self.config
            .retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.retry_max_delay)
            .min(self.config.retry_max_delay)
    }

    pub fn decide_retry(
        &self,
        job: &AiOperationJob,
        budget: &RetryBudget,
        failure: &AttemptFailure,
    ) -> RetryDecision {
        let give_up = |kind: JobErrorKind| {
            RetryDecision::GiveUp(JobError { kind, message: failure.message().to_string() })
        };

        if job.cancel_requested {
            return give_up(JobErrorKind::Cancelled);
        }

        match failure {
            AttemptFailure::Rejected { .. } => give_up(failure.kind()),
            AttemptFailure::InvalidResponse { .. } => {
                if budget.invalid_response_retries_used >= self.config.invalid_response_retries {
                    give_up(failure.kind())
                } else {
                    RetryDecision::RetryAfter(self.backoff(budget.invalid_response_retries_used))
                }
            }
            _ if budget.retries_used >= job.max_retries => give_up(failure.kind()),
            AttemptFailure::RateLimited { retry_after: Some(hint), .. } => RetryDecision::RetryAfter(
                self.backoff(budget.retries_used).max(*hint).min(self.config.retry_max_delay),
            ),
            _ => RetryDecision::RetryAfter(self.backoff(budget.retries_used)),
        }
    }

    /// Running -> Succeeded. The reservation is considered committed.
    pub fn complete(
        &self,
        job: AiOperationJob,
        result: OperationResult,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DispatchError> {
        self.validate_transition(&job, JobStatus::Succeeded)?;
        let context = serde_json::json!({ "attempt_count": job.attempt_count });
        let mut job = job;
        job.result = Some(result);
        Ok(self.finish(job, JobStatus::Succeeded, "job_succeeded", None, context, now))
    }

    /// Running -> Failed. The reservation is considered released.
    pub fn fail(
        &self,
        job: AiOperationJob,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DispatchError> {
        self.validate_transition(&job, JobStatus::Failed)?;
        let context = serde_json::json!({
            "attempt_count": job.attempt_count,
            "max_retries": job.max_retries,
            "message": error.message,
        });
        let kind = error.kind;
        let mut job = job;
        job.error = Some(error);
        let reason = if kind == JobErrorKind::Cancelled { "job_cancelled" } else { "job_failed" };
        Ok(self.finish(job, JobStatus::Failed, reason, Some(kind), context, now))
    }

    pub fn cancel(
        &self,
        mut job: AiOperationJob,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, DispatchError> {
        match job.status {
            JobStatus::Queued => {
                let context = serde_json::json!({ "attempt_count": job.attempt_count });
                job.error = Some(JobError {
                    kind: JobErrorKind::Cancelled,
                    message: "cancelled before execution".to_string(),
                });
                Ok(CancelOutcome::Cancelled(self.finish(
                    job,
                    JobStatus::Failed,
                    "job_cancelled",
                    Some(JobErrorKind::Cancelled),
                    context,
                    now,
                )))
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
                Ok(CancelOutcome::Requested(job))
            }
            JobStatus::Succeeded | JobStatus::Failed => Err(DispatchError::InvalidTransition {
                from: job.status,
                to: JobStatus::Failed,
                reason: "job already in terminal state".to_string(),
            }),
        }
    }

    /// Running -> Queued for a job whose worker stopped heartbeating.
    pub fn requeue_stale(
        &self,
        mut job: AiOperationJob,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DispatchError> {
        if job.status != JobStatus::Running || !self.claim_expired(&job, now) {
            return Err(DispatchError::InvalidTransition {
                from: job.status,
                to: JobStatus::Queued,
                reason: "only running jobs with an expired claim can be requeued".to_string(),
            });
        }

        let previous_worker = job.claimed_by.take();
        job.status = JobStatus::Queued;
        job.claimed_at = None;
        job.state_version += 1;
        job.updated_at = now;

        let transition = self.transition_event(
            &job,
            Some(JobStatus::Running),
            "claim_expired",
            None,
            serde_json::json!({ "previous_worker": previous_worker }),
            "recovery",
            now,
        );
        Ok(TransitionResult { job, transition })
    }

    /// Running jobs whose claim is older than the configured timeout.
    pub fn stale_jobs(&self, jobs: Vec<AiOperationJob>, now: DateTime<Utc>) -> Vec<AiOperationJob> {
        jobs.into_iter()
            .filter(|job| job.status == JobStatus::Running && self.claim_expired(job, now))
            .collect()
    }

    fn claim_expired(&self, job: &AiOperationJob, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.config.claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        job.claimed_at.map_or(true, |claimed_at| claimed_at + timeout <= now)
    }

    fn finish(
        &self,
        mut job: AiOperationJob,
        to: JobStatus,
        reason: &str,
        error_kind: Option<JobErrorKind>,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> TransitionResult {
        let from = job.status;
        let actor = job.claimed_by.clone().unwrap_or_else(|| "dispatcher".to_string());
        job.status = to;
        job.reservation_id = None;
        job.claimed_by = None;
        job.claimed_at = None;
        job.finished_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        let transition =
            self.transition_event(&job, Some(from), reason, error_kind, context, &actor, now);
        TransitionResult { job, transition }
    }

    fn validate_transition(&self, job: &AiOperationJob, to: JobStatus) -> Result<(), DispatchError> {
        let valid = matches!(
            (job.status, to),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Queued, JobStatus::Failed)
        );

        if valid {
            Ok(())
        } else {
            Err(DispatchError::InvalidTransition {
                from: job.status,
                to,
                reason: format!("cannot transition from {:?} to {:?}", job.status, to),
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn transition_event(
        &self,
        job: &AiOperationJob,
        from: Option<JobStatus>,
        reason: &str,
        error_kind: Option<JobErrorKind>,
        context: serde_json::Value,
        actor: &str,
        now: DateTime<Utc>,
    ) -> JobTransitionEvent {
        JobTransitionEvent {
            id: JobTransitionId(Uuid::new_v4().to_string()),
            job_id: job.id.clone(),
            from_status: from,
            to_status: job.status,
            reason: reason.to_string(),
            error_kind,
            context_json: context.to_string(),
            actor: actor.to_string(),
            state_version: job.state_version,
            occurred_at: now,
        }
    }
}

/// Fingerprint of the input an operation ran against.
pub fn hash_input(operation: OperationType, input_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(input_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::domain::job::TargetEntity;

    fn new_job() -> NewJob {
        NewJob {
            user_id: UserId("u-1".to_string()),
            target: TargetEntity::note("n-1"),
            operation: OperationType::Summarize,
            input_text: "hello world".to_string(),
            provider_id: ProviderId("openai".to_string()),
            model_id: ModelId("gpt-4o-mini".to_string()),
            request: RenderedPrompt {
                template_name: "summarize_default".to_string(),
                system_message: "sys".to_string(),
                prompt: "Summarize: hello world".to_string(),
                max_tokens: 100,
                temperature: 0.3,
            },
            reservation_id: ReservationId("r-1".to_string()),
            estimated_tokens: 104,
        }
    }

    fn engine() -> JobEngine {
        JobEngine::with_config(JobEngineConfig {
            max_retries: 3,
            invalid_response_retries: 1,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(500),
            claim_timeout: Duration::from_secs(60),
        })
    }

    fn unavailable() -> AttemptFailure {
        AttemptFailure::Unavailable { message: "502 bad gateway".to_string() }
    }

    #[test]
    fn create_job_starts_queued_with_reservation_and_hash() {
        let created = engine().create_job(new_job(), Utc::now());

        assert_eq!(created.job.status, JobStatus::Queued);
        assert_eq!(created.job.reservation_id, Some(ReservationId("r-1".to_string())));
        assert_eq!(created.job.input_hash, hash_input(OperationType::Summarize, "hello world"));
        assert_eq!(created.transition.from_status, None);
        assert_eq!(created.transition.reason, "job_enqueued");
    }

    #[test]
    fn claim_then_complete_settles_reservation() {
        let engine = engine();
        let now = Utc::now();
        let created = engine.create_job(new_job(), now);
        let claimed = engine.claim(created.job, "worker-1", now).expect("claim");
        assert_eq!(claimed.job.status, JobStatus::Running);
        assert_eq!(claimed.job.claimed_by.as_deref(), Some("worker-1"));

        let done = engine
            .complete(claimed.job, OperationResult::Summary { text: "hi".to_string() }, now)
            .expect("complete");
        assert_eq!(done.job.status, JobStatus::Succeeded);
        assert_eq!(done.job.reservation_id, None);
        assert!(done.job.finished_at.is_some());
        assert_eq!(done.transition.from_status, Some(JobStatus::Running));
    }

    #[test]
    fn terminal_jobs_reject_further_transitions() {
        let engine = engine();
        let now = Utc::now();
        let claimed = engine.claim(engine.create_job(new_job(), now).job, "w", now).expect("claim");
        let done = engine
            .complete(claimed.job, OperationResult::Summary { text: "x".to_string() }, now)
            .expect("complete");

        assert!(matches!(
            engine.claim(done.job.clone(), "w2", now),
            Err(DispatchError::InvalidTransition { from: JobStatus::Succeeded, .. })
        ));
        assert!(engine.cancel(done.job, now).is_err());
    }

    #[test]
    fn transient_failures_retry_exactly_max_retries_times() {
        let engine = engine();
        let job = engine.create_job(new_job(), Utc::now()).job;
        let mut budget = RetryBudget::default();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match engine.decide_retry(&job, &budget, &unavailable()) {
                RetryDecision::RetryAfter(_) => budget.retries_used += 1,
                RetryDecision::GiveUp(error) => {
                    assert_eq!(error.kind, JobErrorKind::ProviderUnavailable);
                    break;
                }
            }
        }
        assert_eq!(attempts, 4);
    }

    #[test]
    fn invalid_response_retry_does_not_consume_transient_allowance() {
        let engine = engine();
        let job = engine.create_job(new_job(), Utc::now()).job;
        let invalid = AttemptFailure::InvalidResponse { message: "garbled".to_string() };
        let mut budget = RetryBudget::default();

        assert!(matches!(engine.decide_retry(&job, &budget, &invalid), RetryDecision::RetryAfter(_)));
        budget.record(&invalid);
        assert_eq!(budget, RetryBudget { retries_used: 0, invalid_response_retries_used: 1 });

        let mut transient_retries = 0;
        while let RetryDecision::RetryAfter(_) = engine.decide_retry(&job, &budget, &unavailable()) {
            budget.record(&unavailable());
            transient_retries += 1;
        }
        assert_eq!(transient_retries, job.max_retries);

        let exhausted = RetryBudget { retries_used: job.max_retries, invalid_response_retries_used: 0 };
        assert!(matches!(
            engine.decide_retry(&job, &exhausted, &invalid),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let engine = engine();
        assert_eq!(engine.backoff(0), Duration::from_millis(100));
        assert_eq!(engine.backoff(1), Duration::from_millis(200));
        assert_eq!(engine.backoff(2), Duration::from_millis(400));
        assert_eq!(engine.backoff(3), Duration::from_millis(500));
        assert_eq!(engine.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn retry_after_hint_raises_delay_within_cap() {
        let engine = engine();
        let job = engine.create_job(new_job(), Utc::now()).job;
        let failure = AttemptFailure::RateLimited {
            message: "429".to_string(),
            retry_after: Some(Duration::from_millis(300)),
        };
        assert_eq!(
            engine.decide_retry(&job, &RetryBudget::default(), &failure),
            RetryDecision::RetryAfter(Duration::from_millis(300))
        );

        let failure = AttemptFailure::RateLimited {
            message: "429".to_string(),
            retry_after: Some(Duration::from_secs(90)),
        };
        assert_eq!(
            engine.decide_retry(&job, &RetryBudget::default(), &failure),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
    }

    #[test]
    fn invalid_response_is_retried_once_and_rejection_never() {
        let engine = engine();
        let job = engine.create_job(new_job(), Utc::now()).job;
        let invalid = AttemptFailure::InvalidResponse { message: "empty".to_string() };

        assert!(matches!(
            engine.decide_retry(&job, &RetryBudget::default(), &invalid),
            RetryDecision::RetryAfter(_)
        ));
        let spent = RetryBudget { retries_used: 0, invalid_response_retries_used: 1 };
        assert!(matches!(
            engine.decide_retry(&job, &spent, &invalid),
            RetryDecision::GiveUp(JobError { kind: JobErrorKind::InvalidResponse, .. })
        ));
        assert!(matches!(
            engine.decide_retry(&job, &spent, &unavailable()),
            RetryDecision::RetryAfter(_)
        ));

        let rejected = AttemptFailure::Rejected { message: "401".to_string() };
        assert!(matches!(
            engine.decide_retry(&job, &RetryBudget::default(), &rejected),
            RetryDecision::GiveUp(JobError { kind: JobErrorKind::ProviderUnavailable, .. })
        ));
    }

    #[test]
    fn cancel_queued_fails_job_and_cancel_running_only_flags() {
        let engine = engine();
        let now = Utc::now();
        let queued = engine.create_job(new_job(), now).job;

        let CancelOutcome::Cancelled(cancelled) = engine.cancel(queued.clone(), now).expect("cancel")
        else {
            panic!("queued job should cancel directly");
        };
        assert_eq!(cancelled.job.status, JobStatus::Failed);
        assert_eq!(cancelled.job.error.as_ref().map(|e| e.kind), Some(JobErrorKind::Cancelled));
        assert_eq!(cancelled.transition.reason, "job_cancelled");

        let running = engine.claim(queued, "w", now).expect("claim").job;
        let CancelOutcome::Requested(flagged) = engine.cancel(running, now).expect("cancel") else {
            panic!("running job should only be flagged");
        };
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(flagged.cancel_requested);
        assert!(matches!(
            engine.decide_retry(&flagged, &RetryBudget::default(), &unavailable()),
            RetryDecision::GiveUp(JobError { kind: JobErrorKind::Cancelled, .. })
        ));
    }

    #[test]
    fn stale_running_jobs_are_requeued() {
        let engine = engine();
        let now = Utc::now();
        let fresh = engine.claim(engine.create_job(new_job(), now).job, "w1", now).expect("claim").job;
        let old_claim = now - chrono::Duration::seconds(120);
        let stale = engine
            .claim(engine.create_job(new_job(), old_claim).job, "w2", old_claim)
            .expect("claim")
            .job;
        let queued = engine.create_job(new_job(), now).job;

        let found = engine.stale_jobs(vec![fresh.clone(), stale.clone(), queued], now);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);

        let requeued = engine.requeue_stale(stale, now).expect("requeue");
        assert_eq!(requeued.job.status, JobStatus::Queued);
        assert_eq!(requeued.job.claimed_by, None);
        assert!(engine.requeue_stale(fresh, now).is_err());
    }
}
