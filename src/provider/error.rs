//! Errors raised while talking to the external imaging provider.
//!
//! [`ProviderError`] keeps just enough of the failure to classify it for
//! retry decisions: the HTTP status when there was one, and any explicit
//! wait the provider asked for.

use std::time::Duration;

use thiserror::Error;

/// Failures of a single outbound provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success HTTP status.
    /// `retry_after` is set when the response carried an explicit wait.
    #[error("provider returned status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The request never produced a response (DNS, refused connection, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The call did not finish within its per-call timeout.
    #[error("request timed out")]
    Timeout,

    /// A response arrived but its body could not be understood.
    #[error("failed to parse provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// HTTP status of the failure, `None` for transport-level failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Explicit wait requested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Status {
                status: status.as_u16(),
                message: err.to_string(),
                retry_after: None,
            }
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display() {
        let err = ProviderError::Status {
            status: 503,
            message: "overloaded".into(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "provider returned status 503: overloaded");
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn transport_errors_have_no_status() {
        assert_eq!(ProviderError::Timeout.status(), None);
        assert_eq!(ProviderError::Network("reset".into()).status(), None);
    }

    #[test]
    fn retry_after_only_on_status_errors() {
        let err = ProviderError::Status {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(ProviderError::Timeout.retry_after(), None);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProviderError>();
    }
}
