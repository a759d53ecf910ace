use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use atelier::collaborators::{
    JobEvent, JobStore, MemoryBlobStore, MemoryJobStore, Notifier, RecordingNotifier,
};
use atelier::job::{Job, JobPatch};
use atelier::ledger::EntryKind;
use atelier::provider::{FixtureProvider, ProviderError, StatusResponse, TaskStatus};
use atelier::{
    Collaborators, Credits, Engine, EngineConfig, EngineError, ErrorKind, JobKind, JobRequest,
    JobStatus, RetryGuidance, Tier,
};

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _: &str, _: JobEvent, _: Value) -> Result<(), EngineError> {
        Err(EngineError::Storage("smtp relay unreachable".into()))
    }
}

struct PanickingNotifier;

#[async_trait]
impl Notifier for PanickingNotifier {
    async fn notify(&self, _: &str, _: JobEvent, _: Value) -> Result<(), EngineError> {
        panic!("notifier bug");
    }
}

struct HangingNotifier;

#[async_trait]
impl Notifier for HangingNotifier {
    async fn notify(&self, _: &str, _: JobEvent, _: Value) -> Result<(), EngineError> {
        std::future::pending().await
    }
}

/// Loses its connection the first time a job is marked running.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryJobStore,
    crashed: AtomicBool,
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, job: &Job) -> Result<(), EngineError> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, EngineError> {
        if patch.status == Some(JobStatus::Running) && !self.crashed.swap(true, Ordering::SeqCst) {
            panic!("store connection lost");
        }
        self.inner.update_job(id, patch).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, EngineError> {
        self.inner.get_job(id).await
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.rate_limit.min_interval_ms = 0;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1000;
    config.retry.jitter_ms = 0;
    config.poll.default_interval_ms = 200;
    config.poll.max_attempts = 10;
    config
}

fn build(config: &EngineConfig, provider: Arc<FixtureProvider>) -> Engine {
    Engine::new(
        config,
        provider,
        Collaborators {
            jobs: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        },
    )
}

fn try_on(account: &str) -> JobRequest {
    JobRequest::new(account, JobKind::TryOn, Tier::Normal).with_input(b"selfie".to_vec(), "image/png")
}

fn server_error() -> ProviderError {
    ProviderError::Status {
        status: 500,
        message: "internal error".into(),
        retry_after: None,
    }
}

fn releases(engine: &Engine, account: &str) -> usize {
    engine
        .ledger()
        .entries(account)
        .iter()
        .filter(|e| e.kind == EntryKind::Release)
        .count()
}

#[tokio::test(start_paused = true)]
async fn successful_job_commits_its_reservation() {
    let provider = Arc::new(FixtureProvider::new());
    let engine = build(&config(), provider);
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    let id = engine.admit(try_on("acct")).await.unwrap();
    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.reserved, Credits::whole(3));
    assert_eq!(account.balance, Credits::whole(10));

    let job = engine.run_once().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.result_ref.is_some());

    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.balance, Credits::whole(7));
    assert_eq!(account.reserved, Credits::ZERO);
}

#[tokio::test(start_paused = true)]
async fn persistent_server_errors_release_credits() {
    let provider = Arc::new(FixtureProvider::new());
    for _ in 0..3 {
        provider.push_submit(Err(server_error()));
    }
    let engine = build(&config(), Arc::clone(&provider));
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();

    assert_eq!(provider.submit_calls(), 3);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::RetryExhausted));
    assert_eq!(job.error_kind.map(ErrorKind::guidance), Some(RetryGuidance::RetryLater));

    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.balance, Credits::whole(10));
    assert_eq!(account.reserved, Credits::ZERO);
    assert_eq!(releases(&engine, "acct"), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_refinement_degrades_without_failing_the_job() {
    let mut config = config();
    config.pipeline.passes = vec!["content-digest".into(), "upscale-4x".into()];
    let engine = build(&config, Arc::new(FixtureProvider::new()));
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(!job.refined);
    assert!(job.error_kind.is_none());
    assert_eq!(
        job.steps_applied,
        vec!["submit:virtual-try-on", "poll", "refine:content-digest", "store"]
    );
    assert_eq!(engine.ledger().account("acct").unwrap().balance, Credits::whole(7));
}

#[tokio::test(start_paused = true)]
async fn oversized_result_skips_size_guard_but_is_stored() {
    let mut config = config();
    config.pipeline.passes = vec!["size-guard".into()];
    config.pipeline.max_artifact_bytes = 4;
    let engine = build(&config, Arc::new(FixtureProvider::new()));
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(!job.refined);
    assert!(job.result_url.is_some());
}

#[tokio::test(start_paused = true)]
async fn provider_task_failure_is_not_retried() {
    let provider = Arc::new(FixtureProvider::new());
    provider.push_status(Ok(StatusResponse {
        status: TaskStatus::Failed,
        error: Some(json!({ "message": "no garment detected" })),
        ..Default::default()
    }));
    let engine = build(&config(), Arc::clone(&provider));
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();

    assert_eq!(provider.submit_calls(), 1);
    assert_eq!(provider.status_calls(), 1);
    assert_eq!(job.error_kind, Some(ErrorKind::TaskFailed));
    assert!(job.error_message.unwrap().contains("no garment detected"));
    assert_eq!(releases(&engine, "acct"), 1);
    assert_eq!(engine.ledger().account("acct").unwrap().balance, Credits::whole(10));
}

#[tokio::test(start_paused = true)]
async fn stuck_task_times_out_and_releases() {
    let provider = Arc::new(FixtureProvider::new().with_processing_polls(u32::MAX));
    let engine = build(&config(), Arc::clone(&provider));
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();

    assert_eq!(provider.status_calls(), 10);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::TaskTimedOut));
    assert_eq!(engine.ledger().account("acct").unwrap().reserved, Credits::ZERO);
}

#[tokio::test(start_paused = true)]
async fn insufficient_balance_makes_no_remote_call() {
    let provider = Arc::new(FixtureProvider::new());
    let engine = build(&config(), Arc::clone(&provider));
    engine.ledger().grant("acct", Credits::whole(2), "signup");

    let err = engine.admit(try_on("acct")).await.unwrap_err();

    assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    assert_eq!(err.kind().guidance(), RetryGuidance::AddCredits);
    assert_eq!(provider.submit_calls(), 0);
    assert!(engine.queue().is_empty());
    let entries = engine.ledger().entries("acct");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Grant);
}

#[tokio::test(start_paused = true)]
async fn double_submission_reserves_once() {
    let engine = build(&config(), Arc::new(FixtureProvider::new()));
    engine.ledger().grant("acct", Credits::whole(5), "signup");

    let (first, second) = tokio::join!(engine.admit(try_on("acct")), engine.admit(try_on("acct")));

    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.reserved, Credits::whole(3));
    assert_eq!(account.available, Credits::whole(2));
}

#[tokio::test(start_paused = true)]
async fn exhausted_rate_window_fails_job_with_retry_later() {
    let mut config = config();
    config.rate_limit.max_calls = 2;
    config.rate_limit.window_ms = 60_000;
    config.rate_limit.max_wait_ms = 1_000;
    let provider = Arc::new(FixtureProvider::new());
    let engine = build(&config, Arc::clone(&provider));
    engine.ledger().grant("acct", Credits::whole(30), "signup");

    for _ in 0..3 {
        engine.admit(try_on("acct")).await.unwrap();
    }
    let mut outcomes = Vec::new();
    while let Some(job) = engine.run_once().await.unwrap() {
        outcomes.push(job);
    }

    assert_eq!(provider.submit_calls(), 2);
    assert_eq!(outcomes[0].status, JobStatus::Succeeded);
    assert_eq!(outcomes[1].status, JobStatus::Succeeded);
    assert_eq!(outcomes[2].error_kind, Some(ErrorKind::RateLimitTimeout));
    assert_eq!(
        outcomes[2].error_kind.map(ErrorKind::guidance),
        Some(RetryGuidance::RetryLater)
    );
    assert_eq!(engine.ledger().account("acct").unwrap().balance, Credits::whole(24));
}

#[tokio::test(start_paused = true)]
async fn notification_failure_does_not_fail_the_job() {
    let engine = Engine::new(
        &config(),
        Arc::new(FixtureProvider::new()),
        Collaborators {
            jobs: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: Arc::new(FailingNotifier),
        },
    );
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn notifier_panic_after_commit_keeps_the_success() {
    let mut config = config();
    config.queue.job_max_attempts = 2;
    let provider = Arc::new(FixtureProvider::new());
    let engine = Engine::new(
        &config,
        provider.clone(),
        Collaborators {
            jobs: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: Arc::new(PanickingNotifier),
        },
    );
    engine.ledger().grant("acct", Credits::whole(10), "signup");
    let first = engine.admit(try_on("acct")).await.unwrap();
    let second = engine.admit(try_on("acct")).await.unwrap();

    engine.spawn_workers(1);
    engine.shutdown().await;

    for id in [first, second] {
        let job = engine.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_kind, None);
    }
    assert_eq!(provider.submit_calls(), 2);
    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.balance, Credits::whole(4));
    assert_eq!(account.reserved, Credits::ZERO);
    assert_eq!(releases(&engine, "acct"), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_notifier_does_not_hold_the_worker() {
    let engine = Engine::new(
        &config(),
        Arc::new(FixtureProvider::new()),
        Collaborators {
            jobs: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: Arc::new(HangingNotifier),
        },
    );
    engine.ledger().grant("acct", Credits::whole(10), "signup");

    engine.admit(try_on("acct")).await.unwrap();
    let job = engine.run_once().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(engine.ledger().account("acct").unwrap().balance, Credits::whole(7));
}

#[tokio::test(start_paused = true)]
async fn crash_retry_during_shutdown_finishes_before_it_returns() {
    let mut config = config();
    config.queue.job_max_attempts = 3;
    config.queue.requeue_base_delay_ms = 500;
    let provider = Arc::new(FixtureProvider::new());
    let engine = Engine::new(
        &config,
        provider.clone(),
        Collaborators {
            jobs: Arc::new(FlakyStore::default()),
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        },
    );
    engine.ledger().grant("acct", Credits::whole(10), "signup");
    let id = engine.admit(try_on("acct")).await.unwrap();

    engine.spawn_workers(1);
    engine.shutdown().await;

    let job = engine.job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 2);
    assert_eq!(provider.submit_calls(), 1);
    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.balance, Credits::whole(7));
    assert_eq!(account.reserved, Credits::ZERO);
}

#[tokio::test(start_paused = true)]
async fn shutdown_without_workers_releases_queued_jobs() {
    let engine = build(&config(), Arc::new(FixtureProvider::new()));
    engine.ledger().grant("acct", Credits::whole(10), "signup");
    let id = engine.admit(try_on("acct")).await.unwrap();

    engine.shutdown().await;

    let job = engine.job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.balance, Credits::whole(10));
    assert_eq!(account.reserved, Credits::ZERO);
    assert_eq!(releases(&engine, "acct"), 1);
}

#[tokio::test(start_paused = true)]
async fn unlimited_accounts_never_run_dry() {
    let engine = build(&config(), Arc::new(FixtureProvider::new()));
    engine.ledger().open_account("studio", true);

    for _ in 0..3 {
        engine.admit(try_on("studio")).await.unwrap();
    }
    while let Some(job) = engine.run_once().await.unwrap() {
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    let account = engine.ledger().account("studio").unwrap();
    assert_eq!(account.balance, Credits::ZERO);
    assert_eq!(account.reserved, Credits::ZERO);
}

#[tokio::test(start_paused = true)]
async fn provider_quota_is_tracked() {
    let provider = Arc::new(FixtureProvider::new().with_remaining_quota(42));
    let engine = build(&config(), provider);
    engine.ledger().grant("acct", Credits::whole(10), "signup");
    assert_eq!(engine.provider_quota(), None);

    engine.admit(try_on("acct")).await.unwrap();
    engine.run_once().await.unwrap();
    assert_eq!(engine.provider_quota(), Some(42));
}

#[tokio::test(start_paused = true)]
async fn workers_serve_both_tiers_and_settle_every_job() {
    let engine = build(&config(), Arc::new(FixtureProvider::new()));
    engine.ledger().grant("acct", Credits::whole(100), "signup");

    let mut ids = Vec::new();
    for i in 0..8 {
        let tier = if i % 2 == 0 { Tier::High } else { Tier::Normal };
        let req = JobRequest::new("acct", JobKind::SkinAnalysis, tier)
            .with_input(format!("scan-{i}").into_bytes(), "image/jpeg");
        ids.push(engine.admit(req).await.unwrap());
    }

    engine.spawn_workers(3);
    engine.shutdown().await;

    for id in ids {
        let job = engine.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    let account = engine.ledger().account("acct").unwrap();
    assert_eq!(account.balance, Credits::whole(92));
    assert_eq!(account.reserved, Credits::ZERO);
}
