use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use noteflow_agent::{
    Completion, CompletionClient, CompletionRequest, DispatchSettings, Dispatcher,
    InMemoryEntityWriter, JobQueue, JobWorker, ProviderError, Services, WorkerEvent,
};
use noteflow_core::catalog::CatalogConfig;
use noteflow_core::config::AppConfig;
use noteflow_core::domain::job::{AiOperationJob, JobErrorKind, JobId, JobStatus, TargetEntity};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::quota::UserId;
use noteflow_core::domain::usage::UsageOutcome;
use noteflow_core::errors::{ApplicationError, DispatchError};
use noteflow_core::job_engine::JobEngine;
use noteflow_core::quota::QuotaDefaults;
use noteflow_db::{
    InMemoryJobRepository, InMemoryQuotaLedger, InMemoryUsageRepository, JobRepository,
    UsageRepository,
};

/// Replays scripted outcomes, then answers successfully.
#[derive(Default)]
struct ScriptedClient {
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedClient {
    fn with_script(script: Vec<Result<Completion, ProviderError>>) -> Self {
        Self { script: Mutex::new(script.into()), ..Self::default() }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.script.lock().await.pop_front().unwrap_or_else(|| Ok(completion("A concise summary.")))
    }
}

fn completion(text: &str) -> Completion {
    Completion {
        text: text.to_string(),
        prompt_tokens: 30,
        completion_tokens: 12,
        total_tokens: 42,
    }
}

fn rate_limited() -> Result<Completion, ProviderError> {
    Err(ProviderError::RateLimited { message: "slow down".to_string(), retry_after: None })
}

fn unavailable() -> Result<Completion, ProviderError> {
    Err(ProviderError::Unavailable("503 Service Unavailable".to_string()))
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    queue: Option<JobQueue>,
    client: Arc<ScriptedClient>,
    usage: Arc<InMemoryUsageRepository>,
    writer: Arc<InMemoryEntityWriter>,
}

impl Harness {
    fn new(client: ScriptedClient, quota: QuotaDefaults) -> Self {
        Self::with_settings(client, quota, |_| {})
    }

    fn with_settings(
        client: ScriptedClient,
        quota: QuotaDefaults,
        adjust: impl FnOnce(&mut DispatchSettings),
    ) -> Self {
        let config = AppConfig::default();
        let registry = CatalogConfig::default().build_registry(&config.llm).expect("registry");
        let templates = CatalogConfig::default().build_templates().expect("templates");

        let client = Arc::new(client);
        let usage = Arc::new(InMemoryUsageRepository::default());
        let writer = Arc::new(InMemoryEntityWriter::default());
        let services = Services {
            registry: Arc::new(RwLock::new(registry)),
            templates: Arc::new(RwLock::new(templates)),
            ledger: Arc::new(InMemoryQuotaLedger::default()),
            jobs: Arc::new(InMemoryJobRepository::default()),
            usage: usage.clone(),
            client: client.clone(),
            writer: writer.clone(),
        };

        let mut settings = DispatchSettings::from_config(&config);
        settings.quota_defaults = quota;
        settings.engine.retry_base_delay = Duration::from_millis(1);
        settings.engine.retry_max_delay = Duration::from_millis(5);
        settings.attempt_timeout = Duration::from_secs(2);
        settings.recovery_interval = Duration::from_secs(3600);
        adjust(&mut settings);

        let (dispatcher, queue) = Dispatcher::new(services, settings);
        Self { dispatcher: Arc::new(dispatcher), queue: Some(queue), client, usage, writer }
    }

    fn start_worker(&mut self) -> noteflow_agent::WorkerHandle {
        let queue = self.queue.take().expect("queue not yet consumed");
        JobWorker::new(&self.dispatcher).start(queue)
    }

    async fn wait_terminal(&self, id: &JobId) -> AiOperationJob {
        for _ in 0..500 {
            let job = self.dispatcher.get_job(id).await.expect("job");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach a terminal state");
    }

    async fn wait_running(&self, id: &JobId) {
        for _ in 0..500 {
            if self.dispatcher.get_job(id).await.expect("job").status == JobStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} was never claimed");
    }
}

fn generous_quota() -> QuotaDefaults {
    QuotaDefaults { max_requests: 100, max_tokens: 1_000_000 }
}

fn user() -> UserId {
    UserId("user-1".to_string())
}

#[tokio::test]
async fn quota_admits_exactly_ten_of_eleven_concurrent_dispatches() {
    let mut harness = Harness::new(
        ScriptedClient::default(),
        QuotaDefaults { max_requests: 10, max_tokens: 1_000_000 },
    );

    let mut handles = Vec::new();
    for index in 0..11 {
        let dispatcher = Arc::clone(&harness.dispatcher);
        handles.push(tokio::spawn(async move {
            dispatcher
                .dispatch(
                    &user(),
                    TargetEntity::note(format!("note-{index}")),
                    OperationType::Summarize,
                    "Weekly sync notes about the launch plan",
                )
                .await
        }));
    }

    let mut admitted = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(job) => {
                assert_eq!(job.status, JobStatus::Queued);
                admitted.push(job.id);
            }
            Err(ApplicationError::Dispatch(DispatchError::QuotaExceeded { .. })) => rejected += 1,
            Err(other) => panic!("unexpected dispatch error: {other}"),
        }
    }
    assert_eq!((admitted.len(), rejected), (10, 1));

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!(quota.reserved_requests, 10);
    assert_eq!(quota.used_requests, 0);

    let handle = harness.start_worker();
    for id in &admitted {
        assert_eq!(harness.wait_terminal(id).await.status, JobStatus::Succeeded);
    }
    handle.shutdown().await.expect("shutdown");

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (10, 0));
    assert_eq!((quota.used_tokens, quota.reserved_tokens), (420, 0));
    assert_eq!(harness.client.calls(), 10);
}

#[tokio::test]
async fn rate_limited_three_times_then_success_takes_four_attempts() {
    let mut harness = Harness::new(
        ScriptedClient::with_script(vec![rate_limited(), rate_limited(), rate_limited()]),
        generous_quota(),
    );
    let handle = harness.start_worker();
    let mut events = handle.events();

    let target = TargetEntity::note("note-429");
    let job = harness
        .dispatcher
        .dispatch(&user(), target.clone(), OperationType::Summarize, "Notes from the design review")
        .await
        .expect("dispatch");

    let finished = harness.wait_terminal(&job.id).await;
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.attempt_count, 4);
    assert_eq!(finished.reservation_id, None);
    assert_eq!(harness.client.calls(), 4);
    assert!(harness.writer.result_for(&target, OperationType::Summarize).await.is_some());

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.used_tokens), (1, 42));
    assert_eq!((quota.reserved_requests, quota.reserved_tokens), (0, 0));

    let usage = harness.usage.list_for_job(&job.id).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].outcome, UsageOutcome::Success);
    assert_eq!(usage[0].tokens_consumed, 42);

    let succeeded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobSucceeded { job_id, attempts, .. }) => break (job_id, attempts),
                Ok(_) => continue,
                Err(error) => panic!("event stream ended: {error}"),
            }
        }
    })
    .await
    .expect("success event");
    assert_eq!(succeeded, (job.id.clone(), 4));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn transient_failures_fail_after_max_retries_plus_one_attempts() {
    let mut harness = Harness::new(
        ScriptedClient::with_script((0..10).map(|_| unavailable()).collect()),
        generous_quota(),
    );
    let handle = harness.start_worker();

    let job = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::task("task-1"), OperationType::TaskBreakdown, "Ship v2")
        .await
        .expect("dispatch");

    let finished = harness.wait_terminal(&job.id).await;
    let max_retries = harness.dispatcher.settings().engine.max_retries;
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.attempt_count, max_retries + 1);
    assert_eq!(
        finished.error.as_ref().map(|error| error.kind),
        Some(JobErrorKind::ProviderUnavailable)
    );
    assert_eq!(harness.client.calls(), (max_retries + 1) as usize);

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (0, 0));

    let usage = harness.usage.list_for_job(&job.id).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].outcome, UsageOutcome::Failure);
    assert_eq!(usage[0].error_kind, Some(JobErrorKind::ProviderUnavailable));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn invalid_responses_are_retried_once_and_rejections_not_at_all() {
    let mut harness = Harness::new(
        ScriptedClient::with_script(vec![
            Ok(completion("   ")),
            Ok(completion("")),
            Err(ProviderError::Rejected { status: 401, message: "bad key".to_string() }),
        ]),
        generous_quota(),
    );
    let handle = harness.start_worker();

    let garbled = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::note("n-1"), OperationType::Summarize, "Meeting notes")
        .await
        .expect("dispatch");
    let garbled = harness.wait_terminal(&garbled.id).await;
    assert_eq!(garbled.attempt_count, 2);
    assert_eq!(garbled.error.map(|error| error.kind), Some(JobErrorKind::InvalidResponse));

    let rejected = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::note("n-2"), OperationType::Summarize, "More notes")
        .await
        .expect("dispatch");
    let rejected = harness.wait_terminal(&rejected.id).await;
    assert_eq!(rejected.attempt_count, 1);
    assert_eq!(rejected.error.map(|error| error.kind), Some(JobErrorKind::ProviderUnavailable));
    assert_eq!(harness.client.calls(), 3);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancelling_a_queued_job_releases_quota_without_calling_provider() {
    let mut harness = Harness::new(ScriptedClient::default(), generous_quota());

    let job = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::note("n-cancel"), OperationType::AnalyzeSentiment, "Great week")
        .await
        .expect("dispatch");

    let cancelled = harness.dispatcher.cancel(&job.id).await.expect("cancel");
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.error.as_ref().map(|error| error.kind), Some(JobErrorKind::Cancelled));

    let handle = harness.start_worker();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.expect("shutdown");

    assert_eq!(harness.client.calls(), 0);
    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (0, 0));

    let again = harness.dispatcher.cancel(&job.id).await;
    assert!(matches!(
        again,
        Err(ApplicationError::Dispatch(DispatchError::InvalidTransition { .. }))
    ));
}

#[tokio::test]
async fn duplicate_dispatches_return_the_same_job() {
    let mut harness = Harness::new(ScriptedClient::default(), generous_quota());
    let target = TargetEntity::note("n-dup");

    let first = harness
        .dispatcher
        .dispatch(&user(), target.clone(), OperationType::ExtractKeywords, "rust, tokio, sqlx")
        .await
        .expect("first");
    let second = harness
        .dispatcher
        .dispatch(&user(), target.clone(), OperationType::ExtractKeywords, "rust, tokio, sqlx")
        .await
        .expect("second");
    assert_eq!(first.id, second.id);

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!(quota.reserved_requests, 1);

    let handle = harness.start_worker();
    let finished = harness.wait_terminal(&first.id).await;
    assert_eq!(finished.status, JobStatus::Succeeded);

    let reused = harness
        .dispatcher
        .dispatch(&user(), target.clone(), OperationType::ExtractKeywords, "rust, tokio, sqlx")
        .await
        .expect("reused");
    assert_eq!(reused.id, first.id);

    let fresh = harness
        .dispatcher
        .dispatch(&user(), target.clone(), OperationType::ExtractKeywords, "python, celery")
        .await
        .expect("fresh");
    assert_ne!(fresh.id, first.id);

    harness.wait_terminal(&fresh.id).await;
    assert_eq!(harness.dispatcher.list_jobs_for_target(&target).await.expect("list").len(), 2);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn empty_input_is_rejected_before_reserving_quota() {
    let harness = Harness::new(ScriptedClient::default(), generous_quota());

    let result = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::note("n-empty"), OperationType::Summarize, "   ")
        .await;
    assert!(matches!(result, Err(ApplicationError::Dispatch(DispatchError::InvalidInput(_)))));

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!(quota.reserved_requests, 0);
}

#[tokio::test]
async fn cancel_of_running_job_takes_effect_after_the_current_attempt() {
    let mut harness = Harness::new(
        ScriptedClient::with_script(vec![unavailable(), unavailable()])
            .with_latency(Duration::from_millis(200)),
        generous_quota(),
    );
    let handle = harness.start_worker();
    let mut events = handle.events();

    let job = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::task("t-cancel"), OperationType::PriorityAnalysis, "Fix login")
        .await
        .expect("dispatch");
    harness.wait_running(&job.id).await;

    let flagged = harness.dispatcher.cancel(&job.id).await.expect("cancel");
    assert_eq!(flagged.status, JobStatus::Running);
    assert!(flagged.cancel_requested);

    let finished = harness.wait_terminal(&job.id).await;
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.error.as_ref().map(|error| error.kind), Some(JobErrorKind::Cancelled));
    assert_eq!(finished.attempt_count, 1);
    assert_eq!(harness.client.calls(), 1);

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (0, 0));

    let cancelled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobCancelled { job_id }) => break job_id,
                Ok(_) => continue,
                Err(error) => panic!("event stream ended: {error}"),
            }
        }
    })
    .await
    .expect("cancel event");
    assert_eq!(cancelled, job.id);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancel_does_not_discard_a_success_on_the_current_attempt() {
    let mut harness = Harness::new(
        ScriptedClient::default().with_latency(Duration::from_millis(200)),
        generous_quota(),
    );
    let handle = harness.start_worker();

    let target = TargetEntity::note("n-late-cancel");
    let job = harness
        .dispatcher
        .dispatch(&user(), target.clone(), OperationType::Summarize, "Quarterly planning notes")
        .await
        .expect("dispatch");
    harness.wait_running(&job.id).await;
    harness.dispatcher.cancel(&job.id).await.expect("cancel");

    let finished = harness.wait_terminal(&job.id).await;
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert!(finished.cancel_requested);
    assert!(finished.result.is_some());
    assert!(harness.writer.result_for(&target, OperationType::Summarize).await.is_some());

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (1, 0));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn recovery_sweep_requeues_stale_claims_and_undelivered_jobs() {
    let mut harness = Harness::with_settings(ScriptedClient::default(), generous_quota(), |settings| {
        settings.queue_capacity = 1;
        settings.engine.claim_timeout = Duration::from_millis(200);
        settings.recovery_interval = Duration::from_millis(50);
    });

    let mut ids = Vec::new();
    for index in 0..3 {
        let job = harness
            .dispatcher
            .dispatch(
                &user(),
                TargetEntity::note(format!("n-recover-{index}")),
                OperationType::IdentifyTopics,
                "Roadmap, hiring and budget",
            )
            .await
            .expect("dispatch");
        ids.push(job.id);
    }

    let jobs = Arc::clone(&harness.dispatcher.services().jobs);
    let orphan = jobs.find_job(&ids[2]).await.expect("find").expect("exists");
    let engine = JobEngine::with_config(harness.dispatcher.settings().engine.clone());
    let abandoned_at = Utc::now() - chrono::Duration::seconds(10);
    let claimed = engine.claim(orphan.clone(), "worker-gone", abandoned_at).expect("claim");
    assert!(jobs
        .apply_transition(&claimed.job, orphan.state_version, claimed.transition)
        .await
        .expect("apply"));

    let handle = harness.start_worker();
    for id in &ids {
        assert_eq!(harness.wait_terminal(id).await.status, JobStatus::Succeeded);
    }
    handle.shutdown().await.expect("shutdown");

    assert_eq!(harness.client.calls(), 3);
    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (3, 0));

    let reasons: Vec<String> = harness
        .dispatcher
        .list_transitions(&ids[2])
        .await
        .expect("audit")
        .into_iter()
        .map(|transition| transition.reason)
        .collect();
    assert!(reasons.iter().any(|reason| reason == "claim_expired"), "{reasons:?}");
}

#[tokio::test]
async fn a_slow_attempt_renews_its_claim_and_runs_once() {
    let mut harness = Harness::with_settings(
        ScriptedClient::default().with_latency(Duration::from_millis(300)),
        generous_quota(),
        |settings| {
            settings.engine.claim_timeout = Duration::from_millis(150);
            settings.recovery_interval = Duration::from_millis(50);
        },
    );
    let handle = harness.start_worker();

    let job = harness
        .dispatcher
        .dispatch(&user(), TargetEntity::note("n-slow"), OperationType::Summarize, "Long retro notes")
        .await
        .expect("dispatch");

    let finished = harness.wait_terminal(&job.id).await;
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.attempt_count, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.client.calls(), 1);

    let reasons: Vec<String> = harness
        .dispatcher
        .list_transitions(&job.id)
        .await
        .expect("audit")
        .into_iter()
        .map(|transition| transition.reason)
        .collect();
    assert!(!reasons.iter().any(|reason| reason == "claim_expired"), "{reasons:?}");

    let quota = harness.dispatcher.get_quota_state(&user()).await.expect("quota");
    assert_eq!((quota.used_requests, quota.reserved_requests), (1, 0));

    handle.shutdown().await.expect("shutdown");
}
