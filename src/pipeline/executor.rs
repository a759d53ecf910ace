//! Runs a [`PipelineSpec`] for one job.
//!
//! Mandatory steps (submit, poll, store) abort the run on failure. Refine
//! steps are optional: a failing pass is logged, recorded as a degradation
//! and the previous artifact carries on. The whole run is bounded by a
//! budget derived from the mandatory steps' own timeouts.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::refine::{Artifact, PROVIDER_PREFIX, RefineError, RefinerRegistry};
use super::spec::{PipelineSpec, Step, StepKind};
use crate::collaborators::{BlobRef, BlobStore};
use crate::error::EngineError;
use crate::poller::{TaskHandle, TaskPoller};
use crate::provider::{ProviderClient, ProviderError, SubmitRequest, TaskResult};
use crate::retry::RetryingInvoker;

const DEFAULT_KEY_PREFIX: &str = "results";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub struct RunContext {
    pub job_id: Uuid,
    pub account_id: String,
}

/// What happened to one refine step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refinement {
    pub pass: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct Output {
    pub result_ref: Option<BlobRef>,
    pub result_url: Option<String>,
    pub steps_applied: Vec<String>,
    pub refinements: Vec<Refinement>,
    /// True only when at least one pass ran and none failed.
    pub refined: bool,
    pub artifact: Option<Artifact>,
    pub error: Option<EngineError>,
}

impl Output {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn degraded(&self) -> impl Iterator<Item = &Refinement> {
        self.refinements.iter().filter(|r| !r.applied)
    }
}

pub struct PipelineExecutor {
    provider: Arc<dyn ProviderClient>,
    submit: RetryingInvoker,
    fetch: RetryingInvoker,
    poller: TaskPoller,
    refiners: RefinerRegistry,
    blobs: Arc<dyn BlobStore>,
    signed_url_ttl: Duration,
}

impl PipelineExecutor {
    /// `submit` should carry the shared rate gate. Downloads reuse it until
    /// [`with_fetch_invoker`](Self::with_fetch_invoker) says otherwise.
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        submit: RetryingInvoker,
        poller: TaskPoller,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            provider,
            fetch: submit.clone(),
            submit,
            poller,
            refiners: RefinerRegistry::default(),
            blobs,
            signed_url_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_refiners(mut self, refiners: RefinerRegistry) -> Self {
        self.refiners = refiners;
        self
    }

    pub fn with_fetch_invoker(mut self, fetch: RetryingInvoker) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_signed_url_ttl(mut self, ttl: Duration) -> Self {
        self.signed_url_ttl = ttl;
        self
    }

    /// Upper bound for a run of `spec`. Local steps get one call timeout
    /// each.
    pub fn budget(&self, spec: &PipelineSpec) -> Duration {
        let steps: Vec<&Step> = spec.enabled_steps().collect();
        let local = self.submit.policy().call_timeout;
        let wait = self.poller.budget().saturating_add(self.fetch.budget());

        steps
            .iter()
            .enumerate()
            .fold(Duration::ZERO, |total, (index, step)| {
                let cost = match step.kind {
                    StepKind::Submit { .. } if explicit_poll_follows(&steps, index) => {
                        self.submit.budget()
                    }
                    StepKind::Submit { .. } => self.submit.budget().saturating_add(wait),
                    StepKind::Poll => wait,
                    StepKind::Refine { .. } | StepKind::Store { .. } => local,
                };
                total.saturating_add(cost)
            })
    }

    /// Runs every enabled step in order. Never panics on step failure;
    /// the outcome, including any error, is in the returned [`Output`].
    pub async fn run(&self, spec: &PipelineSpec, input: Artifact, ctx: &RunContext) -> Output {
        let mut output = Output::default();
        if let Err(err) = spec.validate() {
            output.error = Some(err);
            return output;
        }

        let budget = self.budget(spec);
        debug!(job_id = %ctx.job_id, budget_ms = budget.as_millis() as u64, "pipeline started");

        match timeout(budget, self.execute(spec, input, ctx, &mut output)).await {
            Ok(Ok(artifact)) => output.artifact = Some(artifact),
            Ok(Err(err)) => {
                warn!(job_id = %ctx.job_id, error = %err, "pipeline failed");
                output.error = Some(err);
            }
            Err(_) => {
                let err = EngineError::BudgetExceeded {
                    budget_ms: budget.as_millis() as u64,
                };
                warn!(job_id = %ctx.job_id, error = %err, "pipeline cancelled");
                output.error = Some(err);
            }
        }

        output.refined =
            !output.refinements.is_empty() && output.refinements.iter().all(|r| r.applied);
        output
    }

    async fn execute(
        &self,
        spec: &PipelineSpec,
        input: Artifact,
        ctx: &RunContext,
        output: &mut Output,
    ) -> Result<Artifact, EngineError> {
        let steps: Vec<&Step> = spec.enabled_steps().collect();
        let mut current = input;
        let mut pending: Option<TaskHandle> = None;

        for (index, step) in steps.iter().enumerate() {
            let name = step.name();
            match &step.kind {
                StepKind::Submit { operation, params } => {
                    let handle = self.submit_task(operation, params, &current, ctx).await?;
                    output.steps_applied.push(name);
                    if explicit_poll_follows(&steps, index) {
                        pending = Some(handle);
                    } else {
                        current = self.await_task(handle, &current).await?;
                        output.steps_applied.push(Step::poll().name());
                    }
                }
                StepKind::Poll => {
                    let handle = pending.take().ok_or_else(|| {
                        EngineError::InvalidPipeline("poll without a submitted task".into())
                    })?;
                    current = self.await_task(handle, &current).await?;
                    output.steps_applied.push(name);
                }
                StepKind::Refine { pass, params } => {
                    match self.refine(pass, params, &current).await {
                        Ok(next) => {
                            current = next;
                            output.steps_applied.push(name);
                            output.refinements.push(Refinement {
                                pass: pass.clone(),
                                applied: true,
                                reason: None,
                            });
                        }
                        Err(err) => {
                            let failure = EngineError::OptionalStepFailed {
                                step: name,
                                reason: err.to_string(),
                            };
                            warn!(job_id = %ctx.job_id, error = %failure, "continuing with previous artifact");
                            output.refinements.push(Refinement {
                                pass: pass.clone(),
                                applied: false,
                                reason: Some(err.to_string()),
                            });
                        }
                    }
                }
                StepKind::Store { key_prefix } => {
                    let prefix = key_prefix.as_deref().unwrap_or(DEFAULT_KEY_PREFIX);
                    let key = format!("{prefix}/{}/{}", ctx.account_id, ctx.job_id);
                    let blob = self
                        .blobs
                        .put(&key, &current.bytes, &current.content_type)
                        .await?;
                    let url = self.blobs.signed_url(&blob, self.signed_url_ttl).await?;
                    info!(job_id = %ctx.job_id, blob = %blob, "result stored");
                    output.result_ref = Some(blob);
                    output.result_url = Some(url);
                    output.steps_applied.push(name);
                }
            }
        }
        Ok(current)
    }

    async fn submit_task(
        &self,
        operation: &str,
        params: &Value,
        current: &Artifact,
        ctx: &RunContext,
    ) -> Result<TaskHandle, EngineError> {
        let req = SubmitRequest {
            operation: operation.to_string(),
            params: params.clone(),
            input: (!current.bytes.is_empty()).then(|| STANDARD.encode(&current.bytes)),
            content_type: Some(current.content_type.clone()),
        };
        let provider = &self.provider;
        let req = &req;
        let accepted = self
            .submit
            .call("submit", move || provider.submit(req))
            .await?;
        info!(job_id = %ctx.job_id, operation, task_id = %accepted.task_id, "remote task accepted");
        Ok(accepted.into())
    }

    async fn await_task(
        &self,
        handle: TaskHandle,
        previous: &Artifact,
    ) -> Result<Artifact, EngineError> {
        let result = self.poller.poll_until_terminal(handle).await?;
        self.artifact_from(result, previous).await
    }

    /// Turns a completed task's result into the next artifact: inline data
    /// first, then a download, and finally the metadata itself as JSON.
    async fn artifact_from(
        &self,
        result: TaskResult,
        previous: &Artifact,
    ) -> Result<Artifact, EngineError> {
        let (bytes, content_type) = match (&result.data, &result.url) {
            (Some(data), _) => {
                let bytes = STANDARD.decode(data).map_err(|e| {
                    EngineError::NonRetryable(ProviderError::Parse(format!(
                        "result data is not valid base64: {e}"
                    )))
                })?;
                (bytes, result.content_type.clone())
            }
            (None, Some(url)) => {
                let provider = &self.provider;
                let url = url.as_str();
                let bytes = self
                    .fetch
                    .call("download", move || provider.download(url))
                    .await?;
                (bytes, result.content_type.clone())
            }
            (None, None) => {
                let bytes = serde_json::to_vec(&result.metadata).map_err(|e| {
                    EngineError::NonRetryable(ProviderError::Parse(e.to_string()))
                })?;
                (bytes, Some("application/json".to_string()))
            }
        };

        let content_type = content_type
            .or_else(|| (!previous.content_type.is_empty()).then(|| previous.content_type.clone()))
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let mut artifact = Artifact::new(bytes, content_type);
        for (key, value) in result.metadata {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if key.starts_with(PROVIDER_PREFIX) {
                artifact.metadata.insert(key, value);
            } else {
                artifact.metadata.insert(format!("{PROVIDER_PREFIX}{key}"), value);
            }
        }
        Ok(artifact)
    }

    async fn refine(
        &self,
        pass: &str,
        params: &Value,
        current: &Artifact,
    ) -> Result<Artifact, RefineError> {
        let refiner = self.refiners.get(pass)?;
        let input = current.clone();
        let params = params.clone();
        tokio::task::spawn_blocking(move || refiner.refine(&input, &params))
            .await
            .map_err(|_| RefineError::Panicked)?
    }
}

fn explicit_poll_follows(steps: &[&Step], index: usize) -> bool {
    matches!(steps.get(index + 1).map(|s| &s.kind), Some(StepKind::Poll))
}
