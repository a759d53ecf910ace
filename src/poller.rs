//! Drives an accepted remote task to a terminal state.
//!
//! The provider moves a task through `pending -> processing -> completed |
//! failed`. The poller adds its own terminal outcome, "timed out", reached
//! when `max_attempts` polls pass without the provider reporting a terminal
//! status. A provider-reported failure ends polling immediately; it is never
//! treated as transient.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::PollConfig;
use crate::error::EngineError;
use crate::provider::{ProviderClient, StatusResponse, SubmitResponse, TaskResult, TaskStatus};
use crate::retry::RetryingInvoker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub default_interval: Duration,
    /// Longest wait between polls, whatever the provider suggests.
    pub max_interval: Duration,
}

impl PollSettings {
    /// The wait before the next poll: the provider's suggestion when there is
    /// one, never above the ceiling.
    pub fn interval(&self, suggested: Option<Duration>) -> Duration {
        suggested
            .unwrap_or(self.default_interval)
            .min(self.interval_ceiling())
    }

    fn interval_ceiling(&self) -> Duration {
        self.max_interval.max(self.default_interval)
    }
}

impl From<&PollConfig> for PollSettings {
    fn from(config: &PollConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            default_interval: Duration::from_millis(config.default_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
        }
    }
}

/// Local view of a remote task. Dropped once its result is consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    pub external_id: String,
    pub status: TaskStatus,
    pub progress: Option<f32>,
    pub result: Option<TaskResult>,
    pub suggested_poll_interval: Option<Duration>,
}

impl TaskHandle {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            status: TaskStatus::Pending,
            progress: None,
            result: None,
            suggested_poll_interval: None,
        }
    }

    fn update(&mut self, resp: StatusResponse) {
        self.status = resp.status;
        if resp.progress.is_some() {
            self.progress = resp.progress;
        }
        if let Some(interval) = resp.suggested_interval() {
            self.suggested_poll_interval = Some(interval);
        }
        self.result = resp.result;
    }
}

impl From<SubmitResponse> for TaskHandle {
    fn from(resp: SubmitResponse) -> Self {
        Self {
            external_id: resp.task_id,
            status: resp.status,
            progress: None,
            result: None,
            suggested_poll_interval: resp.poll_interval_ms.map(Duration::from_millis),
        }
    }
}

pub struct TaskPoller {
    provider: Arc<dyn ProviderClient>,
    invoker: RetryingInvoker,
    settings: PollSettings,
}

impl TaskPoller {
    /// `invoker` is used for every status query; give it the shared rate
    /// gate when the provider meters status calls too.
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        invoker: RetryingInvoker,
        settings: PollSettings,
    ) -> Self {
        Self {
            provider,
            invoker,
            settings,
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Hard ceiling on a full polling loop, counting every wait at the
    /// interval ceiling.
    pub fn budget(&self) -> Duration {
        let per_poll = self
            .settings
            .interval_ceiling()
            .saturating_add(self.invoker.budget());
        per_poll.saturating_mul(self.settings.max_attempts)
    }

    pub async fn poll_until_terminal(&self, mut handle: TaskHandle) -> Result<TaskResult, EngineError> {
        let provider = &self.provider;
        let task_id = handle.external_id.clone();
        let id = task_id.as_str();

        for attempt in 1..=self.settings.max_attempts {
            let resp = self
                .invoker
                .call("status", move || provider.status(id))
                .await?;
            let message = resp.error_message();
            let retryable = resp.failure_is_transient();
            handle.update(resp);

            match handle.status {
                TaskStatus::Completed => {
                    info!(task_id = %task_id, polls = attempt, "remote task completed");
                    return handle.result.take().ok_or_else(|| EngineError::TaskFailed {
                        task_id: task_id.clone(),
                        message: "task completed without a result".to_string(),
                        retryable: false,
                    });
                }
                TaskStatus::Failed => {
                    return Err(EngineError::TaskFailed {
                        task_id: task_id.clone(),
                        message,
                        retryable,
                    });
                }
                TaskStatus::Pending | TaskStatus::Processing => {}
            }

            if attempt == self.settings.max_attempts {
                break;
            }
            let interval = self.settings.interval(handle.suggested_poll_interval);
            debug!(
                task_id = %task_id,
                attempt,
                status = %handle.status,
                progress = handle.progress.unwrap_or_default(),
                interval_ms = interval.as_millis() as u64,
                "task not finished"
            );
            sleep(interval).await;
        }

        Err(EngineError::TaskTimedOut {
            task_id,
            polls: self.settings.max_attempts,
            last_status: handle.status,
        })
    }
}
