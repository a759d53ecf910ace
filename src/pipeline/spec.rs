//! Declarative pipeline configuration.
//!
//! A [`PipelineSpec`] is an ordered list of [`Step`]s selected once per
//! request and never mutated while it runs. Step kinds form a closed set;
//! the executor matches on them exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::job::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Submit the current artifact to the provider as a remote task.
    Submit {
        operation: String,
        #[serde(default)]
        params: Value,
    },
    /// Wait for the most recently submitted task to finish.
    Poll,
    /// Local refinement pass. Failure degrades the output, never fails it.
    Refine {
        pass: String,
        #[serde(default)]
        params: Value,
    },
    /// Persist the final artifact. Must be the last enabled step.
    Store {
        #[serde(default)]
        key_prefix: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            enabled: true,
        }
    }

    pub fn submit(operation: impl Into<String>, params: Value) -> Self {
        Self::new(StepKind::Submit {
            operation: operation.into(),
            params,
        })
    }

    pub fn poll() -> Self {
        Self::new(StepKind::Poll)
    }

    pub fn refine(pass: impl Into<String>) -> Self {
        Self::new(StepKind::Refine {
            pass: pass.into(),
            params: Value::Null,
        })
    }

    pub fn store() -> Self {
        Self::new(StepKind::Store { key_prefix: None })
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Name recorded in `steps_applied`.
    pub fn name(&self) -> String {
        match &self.kind {
            StepKind::Submit { operation, .. } => format!("submit:{operation}"),
            StepKind::Poll => "poll".to_string(),
            StepKind::Refine { pass, .. } => format!("refine:{pass}"),
            StepKind::Store { .. } => "store".to_string(),
        }
    }

    pub fn is_mandatory(&self) -> bool {
        !matches!(self.kind, StepKind::Refine { .. })
    }
}

/// Flags that decide which pipeline a request gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePolicy {
    pub refine: bool,
    pub passes: Vec<String>,
}

impl PipelinePolicy {
    /// Applies a per-request refinement override.
    pub fn with_refine(&self, refine: Option<bool>) -> Self {
        Self {
            refine: refine.unwrap_or(self.refine),
            passes: self.passes.clone(),
        }
    }
}

impl From<&PipelineConfig> for PipelinePolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            refine: config.refine,
            passes: config.passes.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<Step>,
}

impl PipelineSpec {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Standard pipeline for a job kind: submit, poll, the configured
    /// refinement passes (disabled when the policy turns refinement off),
    /// then store.
    pub fn for_kind(kind: JobKind, policy: &PipelinePolicy, params: Value) -> Self {
        let mut steps = vec![Step::submit(kind.operation(), params), Step::poll()];
        steps.extend(
            policy
                .passes
                .iter()
                .map(|pass| Step::refine(pass.clone()).enabled(policy.refine)),
        );
        steps.push(Step::store());
        Self { steps }
    }

    pub fn enabled_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.enabled)
    }

    /// Checks ordering rules on the enabled steps: a poll needs an
    /// unpolled submission before it, and at most one store may exist,
    /// in last position.
    pub fn validate(&self) -> Result<(), EngineError> {
        let steps: Vec<&Step> = self.enabled_steps().collect();
        if steps.is_empty() {
            return Err(EngineError::InvalidPipeline("no enabled steps".into()));
        }

        let mut awaiting_poll = false;
        for (index, step) in steps.iter().enumerate() {
            match step.kind {
                StepKind::Submit { .. } => awaiting_poll = true,
                StepKind::Poll => {
                    if !awaiting_poll {
                        return Err(EngineError::InvalidPipeline(format!(
                            "poll at position {index} has no submission to wait for"
                        )));
                    }
                    awaiting_poll = false;
                }
                StepKind::Refine { .. } => awaiting_poll = false,
                StepKind::Store { .. } => {
                    if index + 1 != steps.len() {
                        return Err(EngineError::InvalidPipeline(
                            "store must be the last enabled step".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
