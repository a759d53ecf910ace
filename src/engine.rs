//! Admission and the worker loop.
//!
//! A request is priced, its credits are reserved, the job is recorded and
//! queued. Workers take jobs off the queue, run the pipeline and settle the
//! reservation: commit on success, release on any failure. Every job ends in
//! a terminal status on its record.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    BlobStore, JobEvent, JobStore, LogNotifier, MemoryBlobStore, MemoryJobStore, Notifier,
};
use crate::config::{CostConfig, EngineConfig};
use crate::error::EngineError;
use crate::job::{AuditRecord, Job, JobKind, JobPatch, JobPayload, JobRetryPolicy, JobStatus, Tier};
use crate::ledger::{CreditLedger, ReservationId};
use crate::pipeline::{
    Artifact, Output, PipelineExecutor, PipelinePolicy, PipelineSpec, RefinerRegistry, RunContext,
};
use crate::poller::{PollSettings, TaskPoller};
use crate::provider::ProviderClient;
use crate::queue::JobQueue;
use crate::rate_gate::{RateGate, RateGateSettings};
use crate::retry::{QuotaTracker, RetryPolicy, RetryingInvoker};

/// External services the engine records results with.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// A user's request for one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub account_id: String,
    pub kind: JobKind,
    pub tier: Tier,
    pub payload: JobPayload,
}

impl JobRequest {
    pub fn new(account_id: impl Into<String>, kind: JobKind, tier: Tier) -> Self {
        Self {
            account_id: account_id.into(),
            kind,
            tier,
            payload: JobPayload::default(),
        }
    }

    pub fn with_input(mut self, input: Vec<u8>, content_type: impl Into<String>) -> Self {
        self.payload.input = input;
        self.payload.content_type = content_type.into();
        self
    }
}

struct Inner {
    ledger: CreditLedger,
    queue: JobQueue,
    executor: PipelineExecutor,
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    costs: CostConfig,
    pipeline: PipelinePolicy,
    job_policy: JobRetryPolicy,
    gate: Arc<RateGate>,
    quota: Arc<QuotaTracker>,
    notify_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; clones share one ledger, queue and rate gate.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        provider: Arc<dyn ProviderClient>,
        collaborators: Collaborators,
    ) -> Self {
        let gate = Arc::new(RateGate::new(RateGateSettings::from(&config.rate_limit)));
        let quota = Arc::new(QuotaTracker::default());
        let policy = RetryPolicy::from_config(&config.retry, config.request_timeout());

        let submit = RetryingInvoker::new(policy.clone(), Arc::clone(&quota))
            .with_gate(Arc::clone(&gate));
        let mut status = RetryingInvoker::new(policy, Arc::clone(&quota));
        if config.rate_limit.limit_status_queries {
            status = status.with_gate(Arc::clone(&gate));
        }

        let poller = TaskPoller::new(
            Arc::clone(&provider),
            status.clone(),
            PollSettings::from(&config.poll),
        );
        let executor = PipelineExecutor::new(provider, submit, poller, collaborators.blobs)
            .with_fetch_invoker(status)
            .with_refiners(RefinerRegistry::with_builtins(
                config.pipeline.max_artifact_bytes,
            ))
            .with_signed_url_ttl(Duration::from_secs(config.pipeline.signed_url_ttl_secs));

        Self {
            inner: Arc::new(Inner {
                ledger: CreditLedger::new(),
                queue: JobQueue::from_config(&config.queue),
                executor,
                jobs: collaborators.jobs,
                notifier: collaborators.notifier,
                costs: config.costs.clone(),
                pipeline: PipelinePolicy::from(&config.pipeline),
                job_policy: JobRetryPolicy {
                    max_attempts: config.queue.job_max_attempts,
                    base_delay_ms: config.queue.requeue_base_delay_ms,
                    remove_after_secs: config.queue.remove_after_secs,
                },
                gate,
                quota,
                notify_timeout: config.request_timeout(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.inner.ledger
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.inner.gate
    }

    /// Latest remaining-quota figure the provider reported, if any.
    pub fn provider_quota(&self) -> Option<u64> {
        self.inner.quota.remaining()
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<Job>, EngineError> {
        self.inner.jobs.get_job(id).await
    }

    /// Prices the request, reserves its credits, records the job and queues
    /// it. Nothing reaches the provider when the reservation fails.
    pub async fn admit(&self, req: JobRequest) -> Result<Uuid, EngineError> {
        let cost = self.inner.costs.cost_of(req.kind);
        let mut job = Job::new(
            req.account_id,
            req.tier,
            req.kind,
            req.payload,
            cost,
            self.inner.job_policy.clone(),
        );

        let reservation = self.inner.ledger.reserve(&job.account_id, cost, Some(job.id))?;
        job.reservation = Some(reservation);

        if let Err(err) = self.inner.jobs.create_job(&job).await {
            self.settle(job.id, reservation, false);
            return Err(err);
        }

        let (id, tier, kind) = (job.id, job.tier, job.kind);
        let account_id = job.account_id.clone();
        if let Err(err) = self.inner.queue.enqueue(job) {
            self.settle(id, reservation, false);
            let patch = JobPatch::failed(err.kind(), err.to_string());
            if let Err(store_err) = self.inner.jobs.update_job(id, patch).await {
                error!(job_id = %id, error = %store_err, "failed to record rejected job");
            }
            return Err(err);
        }

        info!(job_id = %id, account_id = %account_id, %kind, %tier, %cost, "job admitted");
        Ok(id)
    }

    /// Starts `count` workers pulling from every tier.
    pub fn spawn_workers(&self, count: usize) {
        let mut workers = self.inner.workers.lock();
        for index in 0..count {
            let engine = self.clone();
            workers.push(tokio::spawn(async move { engine.worker_loop(index).await }));
        }
    }

    /// Takes one job off the queue, if any, and waits for it to finish.
    /// Returns the job's record afterwards.
    pub async fn run_once(&self) -> Result<Option<Job>, EngineError> {
        let Some(job) = self.inner.queue.try_next() else {
            return Ok(None);
        };
        let id = job.id;
        self.run_job(job).await;
        self.inner.jobs.get_job(id).await
    }

    /// Closes the queue and waits for the workers to drain it, retries of
    /// crashed jobs included. Jobs still queued once every worker is gone
    /// are failed and their credits released.
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker ended abnormally");
            }
        }

        while let Some(job) = self.inner.queue.try_next() {
            warn!(job_id = %job.id, "queue closed before the job could run");
            let output = Output {
                error: Some(EngineError::QueueClosed),
                ..Default::default()
            };
            self.record_failure(job, output).await;
        }
        info!("engine stopped");
    }

    async fn worker_loop(self, index: usize) {
        debug!(worker = index, "worker started");
        while let Some(job) = self.inner.queue.next().await {
            self.run_job(job).await;
            let pruned = self.inner.queue.prune_terminal();
            if pruned > 0 {
                debug!(worker = index, pruned, "pruned finished jobs");
            }
        }
        debug!(worker = index, "worker stopped");
    }

    /// Runs a job on its own task so a panic stays contained to that job.
    async fn run_job(&self, mut job: Job) {
        job.attempts += 1;
        let snapshot = job.clone();
        let engine = self.clone();
        match tokio::spawn(async move { engine.process(job).await }).await {
            Ok(Ok(done)) => debug!(job_id = %done.id, status = %done.status, "job finished"),
            Ok(Err(err)) => {
                error!(job_id = %snapshot.id, error = %err, "failed to record job outcome")
            }
            Err(crash) => self.recover(snapshot, crash.to_string()).await,
        }
    }

    /// Runs the job's pipeline and records the outcome.
    pub async fn process(&self, job: Job) -> Result<Job, EngineError> {
        self.inner
            .jobs
            .update_job(job.id, JobPatch::running(job.attempts))
            .await?;

        let policy = self.inner.pipeline.with_refine(job.payload.refine);
        let spec = PipelineSpec::for_kind(job.kind, &policy, job.payload.params.clone());
        let input = Artifact::new(job.payload.input.clone(), job.payload.content_type.clone());
        let ctx = RunContext {
            job_id: job.id,
            account_id: job.account_id.clone(),
        };

        debug!(job_id = %job.id, attempt = job.attempts, kind = %job.kind, "running pipeline");
        let output = self.inner.executor.run(&spec, input, &ctx).await;
        self.finish(&job, output).await
    }

    /// Handles an attempt that panicked. The job is retried on this worker
    /// after the queue-level backoff, unless it already reached an outcome
    /// or has used up its attempts.
    async fn recover(&self, job: Job, reason: String) {
        if let Some(recorded) = self.recorded_outcome(job.id).await {
            warn!(
                job_id = %job.id,
                status = %recorded.status,
                reason = %reason,
                "worker crashed after the job finished, keeping its outcome"
            );
            if let Some(reservation) = job.reservation {
                self.settle(job.id, reservation, recorded.status == JobStatus::Succeeded);
            }
            self.inner.queue.complete(job.id, recorded.status);
            return;
        }
        if let Some(reservation) = job.reservation
            && !self.inner.ledger.is_open(reservation)
        {
            error!(
                job_id = %job.id,
                reason = %reason,
                "worker crashed after settling credits, not retrying"
            );
            return;
        }

        if job.attempts < job.policy.max_attempts {
            let delay = Duration::from_millis(job.policy.delay_for_attempt(job.attempts));
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "worker crashed, requeueing job"
            );
            sleep(delay).await;
            self.inner.queue.requeue(job);
        } else {
            error!(job_id = %job.id, attempts = job.attempts, reason = %reason, "worker crashed, giving up");
            let output = Output {
                error: Some(EngineError::WorkerCrashed {
                    attempts: job.attempts,
                }),
                ..Default::default()
            };
            self.record_failure(job, output).await;
        }
    }

    /// The stored record, if it already carries a terminal status.
    async fn recorded_outcome(&self, id: Uuid) -> Option<Job> {
        match self.inner.jobs.get_job(id).await {
            Ok(Some(job)) if job.status.is_terminal() => Some(job),
            Ok(_) => None,
            Err(err) => {
                warn!(job_id = %id, error = %err, "could not read job record");
                None
            }
        }
    }

    /// Fails a job outside the pipeline. A panic while recording still
    /// releases the reservation.
    async fn record_failure(&self, job: Job, output: Output) {
        let (id, reservation) = (job.id, job.reservation);
        let engine = self.clone();
        match tokio::spawn(async move { engine.finish(&job, output).await }).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(job_id = %id, error = %err, "failed to record failed job"),
            Err(crash) => {
                error!(job_id = %id, error = %crash, "crashed while recording failed job");
                if let Some(reservation) = reservation {
                    self.settle(id, reservation, false);
                }
                self.inner.queue.complete(id, JobStatus::Failed);
            }
        }
    }

    /// Records the terminal status, then settles the reservation to match
    /// it. A job that already has a terminal record is left as it is.
    async fn finish(&self, job: &Job, output: Output) -> Result<Job, EngineError> {
        if let Some(recorded) = self.recorded_outcome(job.id).await {
            debug!(job_id = %job.id, status = %recorded.status, "job already finished");
            return Ok(recorded);
        }

        let succeeded = output.error.is_none();
        let (patch, event) = match output.error {
            None => (
                JobPatch {
                    status: Some(JobStatus::Succeeded),
                    result_ref: output.result_ref,
                    result_url: output.result_url,
                    steps_applied: Some(output.steps_applied),
                    refined: Some(output.refined),
                    ..Default::default()
                },
                JobEvent::JobSucceeded,
            ),
            Some(err) => {
                let mut patch = JobPatch::failed(err.kind(), err.to_string());
                patch.steps_applied = Some(output.steps_applied);
                patch.refined = Some(false);
                (patch, JobEvent::JobFailed)
            }
        };

        let status = patch.status.unwrap_or(JobStatus::Failed);
        let recorded = self.inner.jobs.update_job(job.id, patch).await;
        if let Some(reservation) = job.reservation {
            self.settle(job.id, reservation, succeeded);
        }
        self.inner.queue.complete(job.id, status);
        let updated = recorded?;

        match updated.error_kind {
            None => info!(
                job_id = %updated.id,
                refined = updated.refined,
                steps = updated.steps_applied.len(),
                "job succeeded"
            ),
            Some(kind) => warn!(
                job_id = %updated.id,
                error_kind = %kind,
                guidance = %kind.guidance(),
                message = updated.error_message.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }

        self.notify(&updated, event).await;
        Ok(updated)
    }

    /// Delivers the audit record on its own task, bounded by the notify
    /// timeout. The job's outcome is already recorded and never changes.
    async fn notify(&self, job: &Job, event: JobEvent) {
        let payload = serde_json::to_value(AuditRecord::from_job(job)).unwrap_or_default();
        let notifier = Arc::clone(&self.inner.notifier);
        let account_id = job.account_id.clone();
        let delivery =
            tokio::spawn(async move { notifier.notify(&account_id, event, payload).await });

        match timeout(self.inner.notify_timeout, delivery).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(job_id = %job.id, error = %err, "notification failed"),
            Ok(Err(crash)) => warn!(job_id = %job.id, error = %crash, "notifier crashed"),
            Err(_) => warn!(
                job_id = %job.id,
                timeout_ms = self.inner.notify_timeout.as_millis() as u64,
                "notification timed out"
            ),
        }
    }

    fn settle(&self, job_id: Uuid, reservation: ReservationId, commit: bool) {
        let result = if commit {
            self.inner.ledger.commit(reservation)
        } else {
            self.inner.ledger.release(reservation)
        };
        if let Err(err) = result {
            error!(job_id = %job_id, error = %err, commit, "failed to settle reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingNotifier;
    use crate::credits::Credits;
    use crate::error::ErrorKind;
    use crate::ledger::EntryKind;
    use crate::provider::FixtureProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Job store that panics while marking a job running, a fixed number
    /// of times.
    struct CrashingStore {
        inner: MemoryJobStore,
        crashes_left: AtomicU32,
    }

    #[async_trait]
    impl JobStore for CrashingStore {
        async fn create_job(&self, job: &Job) -> Result<(), EngineError> {
            self.inner.create_job(job).await
        }

        async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, EngineError> {
            if patch.status == Some(JobStatus::Running)
                && self
                    .crashes_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
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
        config.retry.jitter_ms = 0;
        config.retry.base_delay_ms = 100;
        config.poll.default_interval_ms = 100;
        config.queue.requeue_base_delay_ms = 50;
        config.queue.job_max_attempts = 2;
        config
    }

    fn engine_with(jobs: Arc<dyn JobStore>, notifier: Arc<RecordingNotifier>) -> Engine {
        Engine::new(
            &config(),
            Arc::new(FixtureProvider::new()),
            Collaborators {
                jobs,
                blobs: Arc::new(MemoryBlobStore::new()),
                notifier,
            },
        )
    }

    fn request() -> JobRequest {
        JobRequest::new("acct", JobKind::TryOn, Tier::Normal).with_input(b"img".to_vec(), "image/png")
    }

    async fn wait_terminal(engine: &Engine, id: Uuid) -> Job {
        for _ in 0..200 {
            if let Some(job) = engine.job(id).await.unwrap()
                && job.status.is_terminal()
            {
                return job;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("job {id} never reached a terminal status");
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_job_succeeds_and_commits() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(MemoryJobStore::new()), Arc::clone(&notifier));
        engine.ledger().grant("acct", Credits::whole(10), "test");

        let id = engine.admit(request()).await.unwrap();
        assert_eq!(engine.ledger().account("acct").unwrap().reserved, Credits::whole(3));
        assert_eq!(engine.queue().status(id), Some(JobStatus::Queued));

        let job = engine.run_once().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.refined);
        assert!(job.result_url.is_some());
        assert_eq!(job.attempts, 1);

        let account = engine.ledger().account("acct").unwrap();
        assert_eq!(account.balance, Credits::whole(7));
        assert_eq!(account.reserved, Credits::ZERO);
        assert_eq!(notifier.events()[0].1, JobEvent::JobSucceeded);
        assert_eq!(engine.queue().status(id), Some(JobStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_balance_is_rejected_before_queueing() {
        let jobs = Arc::new(MemoryJobStore::new());
        let engine = engine_with(jobs.clone(), Arc::new(RecordingNotifier::new()));
        engine.ledger().grant("acct", Credits::whole(2), "test");

        let err = engine.admit(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert!(jobs.is_empty());
        assert!(engine.queue().is_empty());
        assert!(engine.run_once().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refine_override_skips_passes() {
        let engine = engine_with(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RecordingNotifier::new()),
        );
        engine.ledger().grant("acct", Credits::whole(10), "test");
        let mut req = request();
        req.payload.refine = Some(false);
        engine.admit(req).await.unwrap();

        let job = engine.run_once().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(!job.refined);
        assert_eq!(job.steps_applied, vec!["submit:virtual-try-on", "poll", "store"]);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_requeues_then_succeeds() {
        let store = Arc::new(CrashingStore {
            inner: MemoryJobStore::new(),
            crashes_left: AtomicU32::new(1),
        });
        let engine = engine_with(store, Arc::new(RecordingNotifier::new()));
        engine.ledger().grant("acct", Credits::whole(10), "test");
        let id = engine.admit(request()).await.unwrap();

        engine.spawn_workers(1);
        let job = wait_terminal(&engine, id).await;

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 2);
        assert_eq!(engine.ledger().account("acct").unwrap().balance, Credits::whole(7));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_crashes_fail_job_and_release_credits() {
        let store = Arc::new(CrashingStore {
            inner: MemoryJobStore::new(),
            crashes_left: AtomicU32::new(u32::MAX),
        });
        let engine = engine_with(store, Arc::new(RecordingNotifier::new()));
        engine.ledger().grant("acct", Credits::whole(10), "test");
        let id = engine.admit(request()).await.unwrap();

        engine.spawn_workers(1);
        let job = wait_terminal(&engine, id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(ErrorKind::WorkerCrashed));
        let account = engine.ledger().account("acct").unwrap();
        assert_eq!(account.balance, Credits::whole(10));
        assert_eq!(account.reserved, Credits::ZERO);
        let releases = engine
            .ledger()
            .entries("acct")
            .into_iter()
            .filter(|e| e.kind == EntryKind::Release)
            .count();
        assert_eq!(releases, 1);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_queue_on_shutdown() {
        let engine = engine_with(
            Arc::new(MemoryJobStore::new()),
            Arc::new(RecordingNotifier::new()),
        );
        engine.ledger().grant("acct", Credits::whole(100), "test");
        let mut ids = Vec::new();
        for tier in [Tier::High, Tier::Normal, Tier::High, Tier::Normal] {
            let req = JobRequest::new("acct", JobKind::SkinAnalysis, tier);
            ids.push(engine.admit(req).await.unwrap());
        }

        engine.spawn_workers(2);
        engine.shutdown().await;

        for id in ids {
            let job = engine.job(id).await.unwrap().unwrap();
            assert!(job.status.is_terminal(), "{id} is {}", job.status);
        }
        assert!(matches!(
            engine.admit(request()).await,
            Err(EngineError::QueueClosed)
        ));
        assert_eq!(engine.ledger().account("acct").unwrap().reserved, Credits::ZERO);
    }
}
