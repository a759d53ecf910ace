use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::credits::Credits;
use crate::provider::{ProviderError, TaskStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "insufficient balance on account {account_id}: requested {requested}, available {available}"
    )]
    InsufficientBalance {
        account_id: String,
        requested: Credits,
        available: Credits,
    },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("no provider call slot within {waited_ms}ms")]
    RateLimitTimeout { waited_ms: u64 },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: ProviderError },

    #[error("provider rejected request: {0}")]
    NonRetryable(ProviderError),

    #[error("task {task_id} failed: {message}")]
    TaskFailed {
        task_id: String,
        message: String,
        /// The provider marked the failure as transient.
        retryable: bool,
    },

    #[error("task {task_id} still {last_status} after {polls} polls")]
    TaskTimedOut {
        task_id: String,
        polls: u32,
        last_status: TaskStatus,
    },

    #[error("optional step {step} failed: {reason}")]
    OptionalStepFailed { step: String, reason: String },

    #[error("job exceeded its {budget_ms}ms budget")]
    BudgetExceeded { budget_ms: u64 },

    #[error("worker crashed on all {attempts} attempts")]
    WorkerCrashed { attempts: u32 },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("job queue is closed")]
    QueueClosed,

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// The category persisted on a failed job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            EngineError::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
            EngineError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            EngineError::NonRetryable(_) => ErrorKind::NonRetryable,
            EngineError::TaskFailed {
                retryable: true, ..
            } => ErrorKind::TransientTaskFailure,
            EngineError::TaskFailed { .. } => ErrorKind::TaskFailed,
            EngineError::TaskTimedOut { .. } => ErrorKind::TaskTimedOut,
            EngineError::OptionalStepFailed { .. } => ErrorKind::OptionalStepFailed,
            EngineError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            EngineError::WorkerCrashed { .. } => ErrorKind::WorkerCrashed,
            EngineError::InvalidPipeline(_) => ErrorKind::InvalidRequest,
            EngineError::AccountNotFound(_)
            | EngineError::ReservationNotFound(_)
            | EngineError::QueueClosed
            | EngineError::JobNotFound(_)
            | EngineError::Storage(_)
            | EngineError::Config(_) => ErrorKind::Internal,
        }
    }
}

/// Classifies a job failure for the caller. Stored on the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InsufficientBalance,
    RateLimitTimeout,
    RetryExhausted,
    NonRetryable,
    TaskFailed,
    /// The provider failed the task but reported the cause as transient.
    TransientTaskFailure,
    TaskTimedOut,
    OptionalStepFailed,
    BudgetExceeded,
    WorkerCrashed,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn guidance(self) -> RetryGuidance {
        match self {
            ErrorKind::InsufficientBalance => RetryGuidance::AddCredits,
            ErrorKind::NonRetryable | ErrorKind::InvalidRequest | ErrorKind::TaskFailed => {
                RetryGuidance::DoNotRetry
            }
            ErrorKind::RateLimitTimeout
            | ErrorKind::RetryExhausted
            | ErrorKind::TransientTaskFailure
            | ErrorKind::TaskTimedOut
            | ErrorKind::OptionalStepFailed
            | ErrorKind::BudgetExceeded
            | ErrorKind::WorkerCrashed
            | ErrorKind::Internal => RetryGuidance::RetryLater,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the caller should do about a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryGuidance {
    /// Not enough credits; top up before resubmitting.
    AddCredits,
    /// The provider or the engine was unavailable; resubmit later.
    RetryLater,
    /// The request itself was rejected; resubmitting will not help.
    DoNotRetry,
}

impl fmt::Display for RetryGuidance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryGuidance::AddCredits => write!(f, "add credits and resubmit"),
            RetryGuidance::RetryLater => write!(f, "provider unavailable, try again later"),
            RetryGuidance::DoNotRetry => write!(f, "request is invalid, do not retry"),
        }
    }
}
