//! Deterministic in-process provider.
//!
//! Used by `demo`, by tests, and by `mode = "fixture"` deployments. Every
//! submitted task reports `processing` for a fixed number of polls and then
//! completes with an inline result derived from its input. Scripted
//! responses can be queued ahead of that default behavior to simulate
//! outages, rate limits and task failures.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde_json::Value;

use super::ProviderClient;
use super::error::ProviderError;
use super::types::{
    Metered, ResponseMeta, StatusResponse, SubmitRequest, SubmitResponse, TaskResult, TaskStatus,
};

struct FixtureTask {
    operation: String,
    input: Vec<u8>,
    content_type: Option<String>,
    polls: u32,
}

#[derive(Default)]
struct FixtureState {
    next_id: u64,
    submit_script: VecDeque<Result<SubmitResponse, ProviderError>>,
    status_script: VecDeque<Result<StatusResponse, ProviderError>>,
    tasks: HashMap<String, FixtureTask>,
    submit_calls: u32,
    status_calls: u32,
    download_calls: u32,
}

pub struct FixtureProvider {
    state: Mutex<FixtureState>,
    processing_polls: u32,
    remaining_quota: Option<u64>,
}

impl Default for FixtureProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FixtureState::default()),
            processing_polls: 1,
            remaining_quota: None,
        }
    }

    /// Number of `processing` answers before a task completes.
    pub fn with_processing_polls(mut self, polls: u32) -> Self {
        self.processing_polls = polls;
        self
    }

    /// Remaining-quota value reported on every successful response.
    pub fn with_remaining_quota(mut self, remaining: u64) -> Self {
        self.remaining_quota = Some(remaining);
        self
    }

    /// Queues an answer for the next submission, ahead of the default.
    pub fn push_submit(&self, response: Result<SubmitResponse, ProviderError>) {
        self.state.lock().submit_script.push_back(response);
    }

    /// Queues an answer for the next status query, ahead of the default.
    pub fn push_status(&self, response: Result<StatusResponse, ProviderError>) {
        self.state.lock().status_script.push_back(response);
    }

    pub fn submit_calls(&self) -> u32 {
        self.state.lock().submit_calls
    }

    pub fn status_calls(&self) -> u32 {
        self.state.lock().status_calls
    }

    pub fn download_calls(&self) -> u32 {
        self.state.lock().download_calls
    }

    /// The bytes a task with this operation and input completes with.
    pub fn render(operation: &str, input: &[u8]) -> Vec<u8> {
        let mut out = format!("{operation}:").into_bytes();
        out.extend_from_slice(input);
        out
    }

    fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            remaining_quota: self.remaining_quota,
            retry_after: None,
        }
    }

    fn completed(task_id: &str, task: &FixtureTask) -> StatusResponse {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "provider.task_id".to_string(),
            Value::String(task_id.to_string()),
        );
        metadata.insert(
            "operation".to_string(),
            Value::String(task.operation.clone()),
        );
        StatusResponse {
            status: TaskStatus::Completed,
            progress: Some(1.0),
            result: Some(TaskResult {
                data: Some(STANDARD.encode(Self::render(&task.operation, &task.input))),
                url: None,
                content_type: task.content_type.clone(),
                metadata,
            }),
            error: None,
            poll_interval_ms: None,
        }
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    async fn submit(&self, req: &SubmitRequest) -> Result<Metered<SubmitResponse>, ProviderError> {
        let mut state = self.state.lock();
        state.submit_calls += 1;

        let response = match state.submit_script.pop_front() {
            Some(scripted) => scripted?,
            None => {
                state.next_id += 1;
                SubmitResponse {
                    task_id: format!("fx-{}", state.next_id),
                    status: TaskStatus::Pending,
                    poll_interval_ms: None,
                }
            }
        };

        let input = match &req.input {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map_err(|e| ProviderError::Status {
                    status: 400,
                    message: format!("input is not valid base64: {e}"),
                    retry_after: None,
                })?,
            None => Vec::new(),
        };
        state.tasks.insert(
            response.task_id.clone(),
            FixtureTask {
                operation: req.operation.clone(),
                input,
                content_type: req.content_type.clone(),
                polls: 0,
            },
        );

        Ok(Metered::new(response, self.meta()))
    }

    async fn status(&self, task_id: &str) -> Result<Metered<StatusResponse>, ProviderError> {
        let mut state = self.state.lock();
        state.status_calls += 1;

        if let Some(scripted) = state.status_script.pop_front() {
            return scripted.map(|resp| Metered::new(resp, self.meta()));
        }

        let processing_polls = self.processing_polls;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                message: format!("unknown task {task_id}"),
                retry_after: None,
            })?;
        task.polls += 1;

        let response = if task.polls <= processing_polls {
            StatusResponse {
                status: TaskStatus::Processing,
                progress: Some(task.polls as f32 / (processing_polls as f32 + 1.0)),
                ..Default::default()
            }
        } else {
            Self::completed(task_id, task)
        };
        Ok(Metered::new(response, self.meta()))
    }

    async fn download(&self, url: &str) -> Result<Metered<Vec<u8>>, ProviderError> {
        self.state.lock().download_calls += 1;
        Ok(Metered::new(url.as_bytes().to_vec(), self.meta()))
    }
}
