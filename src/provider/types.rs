//! Wire types for the imaging provider's task API.
//!
//! The provider accepts a submission and answers with a task id; the task is
//! then polled until it reports a terminal status. Optional fields are
//! common in practice, so everything beyond the task id and status defaults
//! when absent, and a few status spellings seen in the wild are accepted as
//! aliases.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Remote task lifecycle as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    #[serde(alias = "submitted", alias = "queued")]
    Pending,
    #[serde(alias = "running", alias = "in_progress")]
    Processing,
    #[serde(alias = "succeeded", alias = "success")]
    Completed,
    #[serde(alias = "error")]
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Body of `POST /v1/tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Provider operation name (e.g. "virtual-try-on").
    pub operation: String,
    /// Operation parameters, passed through untouched.
    #[serde(default)]
    pub params: Value,
    /// Base64-encoded input image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(alias = "task_id", alias = "id")]
    pub task_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, alias = "poll_interval_ms", alias = "pollInterval")]
    pub poll_interval_ms: Option<u64>,
}

/// Answer to `GET /v1/tasks/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Error payload for failed tasks; a string or an object depending on
    /// the operation.
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default, alias = "poll_interval_ms", alias = "pollInterval")]
    pub poll_interval_ms: Option<u64>,
}

impl StatusResponse {
    /// Human-readable rendering of the error payload.
    pub fn error_message(&self) -> String {
        match &self.error {
            None | Some(Value::Null) => "provider reported failure without details".to_string(),
            Some(Value::String(msg)) => msg.clone(),
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(other) => other.to_string(),
        }
    }

    /// True when the error payload marks the failure as transient
    /// (`retryable` or `transient` set to `true`).
    pub fn failure_is_transient(&self) -> bool {
        match &self.error {
            Some(Value::Object(map)) => ["retryable", "transient"]
                .iter()
                .any(|key| map.get(*key).and_then(Value::as_bool) == Some(true)),
            _ => false,
        }
    }

    pub fn suggested_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }
}

/// Output of a completed task. The image is either inline (base64) or
/// behind a download URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(default, alias = "data_base64")]
    pub data: Option<String>,
    #[serde(default, alias = "download_url")]
    pub url: Option<String>,
    #[serde(default, alias = "content_type")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Signals read from response headers. Absence of either is normal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub remaining_quota: Option<u64>,
    pub retry_after: Option<Duration>,
}

/// A decoded response together with its header signals.
#[derive(Debug, Clone, PartialEq)]
pub struct Metered<T> {
    pub value: T,
    pub meta: ResponseMeta,
}

impl<T> Metered<T> {
    pub fn new(value: T, meta: ResponseMeta) -> Self {
        Self { value, meta }
    }

    /// Wraps a value that arrived without any header signals.
    pub fn bare(value: T) -> Self {
        Self {
            value,
            meta: ResponseMeta::default(),
        }
    }
}
