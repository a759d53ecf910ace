use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::collaborators::BlobRef;
use crate::credits::Credits;
use crate::error::{ErrorKind, RetryGuidance};
use crate::ledger::ReservationId;

/// The image-processing features exposed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TryOn,
    SkinAnalysis,
    Aging,
    StyleGeneration,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::TryOn,
        JobKind::SkinAnalysis,
        JobKind::Aging,
        JobKind::StyleGeneration,
    ];

    /// Operation name on the provider's task API.
    pub fn operation(self) -> &'static str {
        match self {
            JobKind::TryOn => "virtual-try-on",
            JobKind::SkinAnalysis => "skin-analysis",
            JobKind::Aging => "aging-simulation",
            JobKind::StyleGeneration => "style-generation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::TryOn => write!(f, "try_on"),
            JobKind::SkinAnalysis => write!(f, "skin_analysis"),
            JobKind::Aging => write!(f, "aging"),
            JobKind::StyleGeneration => write!(f, "style_generation"),
        }
    }
}

/// Queue tier. Declared highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Normal,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::High, Tier::Normal];

    pub fn index(self) -> usize {
        match self {
            Tier::High => 0,
            Tier::Normal => 1,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::High => write!(f, "high"),
            Tier::Normal => write!(f, "normal"),
        }
    }
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Queue-level retry behavior, carried by each job.
///
/// These attempts cover worker crashes only. Transient provider errors are
/// retried inside the pipeline and never reach this policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRetryPolicy {
    /// Maximum number of times a job is handed to a worker.
    pub max_attempts: u32,
    /// Base delay in milliseconds before a crashed job is requeued.
    pub base_delay_ms: u64,
    /// Age after which a terminal job is dropped from the queue's index.
    pub remove_after_secs: u64,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            remove_after_secs: 86_400,
        }
    }
}

impl JobRetryPolicy {
    /// Calculate the requeue delay for a given attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }

    pub fn remove_after(&self) -> Duration {
        Duration::from_secs(self.remove_after_secs)
    }
}

/// Input supplied by the caller at admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub input: Vec<u8>,
    pub content_type: String,
    /// Operation parameters forwarded to the provider.
    #[serde(default)]
    pub params: Value,
    /// Overrides the configured refinement flag for this request.
    #[serde(default)]
    pub refine: Option<bool>,
}

/// A unit of work owned by the queue and a worker until it is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub account_id: String,
    pub tier: Tier,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub policy: JobRetryPolicy,
    pub cost: Credits,
    pub reservation: Option<ReservationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub result_ref: Option<BlobRef>,
    pub result_url: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub steps_applied: Vec<String>,
    pub refined: bool,
}

impl Job {
    pub fn new(
        account_id: String,
        tier: Tier,
        kind: JobKind,
        payload: JobPayload,
        cost: Credits,
        policy: JobRetryPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            tier,
            kind,
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            policy,
            cost,
            reservation: None,
            created_at: now,
            updated_at: now,
            terminal_at: None,
            result_ref: None,
            result_url: None,
            error_kind: None,
            error_message: None,
            steps_applied: Vec::new(),
            refined: false,
        }
    }

    /// Applies a partial update. Terminal jobs get `terminal_at` stamped once.
    pub fn apply(&mut self, patch: JobPatch) {
        let now = Utc::now();
        if let Some(status) = patch.status {
            self.status = status;
            if status.is_terminal() && self.terminal_at.is_none() {
                self.terminal_at = Some(now);
            }
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(result_ref) = patch.result_ref {
            self.result_ref = Some(result_ref);
        }
        if let Some(url) = patch.result_url {
            self.result_url = Some(url);
        }
        if let Some(kind) = patch.error_kind {
            self.error_kind = Some(kind);
        }
        if let Some(message) = patch.error_message {
            self.error_message = Some(message);
        }
        if let Some(steps) = patch.steps_applied {
            self.steps_applied = steps;
        }
        if let Some(refined) = patch.refined {
            self.refined = refined;
        }
        self.updated_at = now;
    }
}

/// Partial update sent to the job store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub result_ref: Option<BlobRef>,
    pub result_url: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub steps_applied: Option<Vec<String>>,
    pub refined: Option<bool>,
}

impl JobPatch {
    pub fn running(attempts: u32) -> Self {
        Self {
            status: Some(JobStatus::Running),
            attempts: Some(attempts),
            ..Default::default()
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_kind: Some(kind),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Structured audit record produced at job completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Uuid,
    pub account_id: String,
    pub kind: JobKind,
    pub tier: Tier,
    pub status: JobStatus,
    pub attempts: u32,
    pub cost: Credits,
    pub steps_applied: Vec<String>,
    pub refined: bool,
    pub result_url: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub guidance: Option<RetryGuidance>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    /// Generate an audit record from a completed or failed job.
    pub fn from_job(job: &Job) -> Self {
        let completed_at = job.terminal_at.unwrap_or_else(Utc::now);
        let duration = completed_at - job.created_at;

        Self {
            job_id: job.id,
            account_id: job.account_id.clone(),
            kind: job.kind,
            tier: job.tier,
            status: job.status,
            attempts: job.attempts,
            cost: job.cost,
            steps_applied: job.steps_applied.clone(),
            refined: job.refined,
            result_url: job.result_url.clone(),
            error_kind: job.error_kind,
            error_message: job.error_message.clone(),
            guidance: job.error_kind.map(ErrorKind::guidance),
            started_at: job.created_at,
            completed_at,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
