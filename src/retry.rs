//! Classification-aware retries around single provider calls.
//!
//! A failure is transient when it has no HTTP status (the call never got a
//! response), a 5xx status, or 429. Every other status fails fast. Between
//! attempts the invoker honors an explicit `retry-after` from the provider
//! verbatim, otherwise it waits `min(max_delay, base_delay * 2^attempt)`
//! plus a small random jitter so concurrent workers do not retry in lockstep.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::EngineError;
use crate::provider::{Metered, ProviderError, ResponseMeta};
use crate::rate_gate::RateGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to computed delays.
    pub jitter: Duration,
    /// Statuses treated as transient in addition to 5xx and 429.
    pub retryable_statuses: Vec<u16>,
    /// Hard timeout applied to each individual call.
    pub call_timeout: Duration,
    /// Ceiling on a provider-requested wait. Longer requests are clamped.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            retryable_statuses: config.retryable_statuses.clone(),
            call_timeout,
            max_retry_after: Duration::from_millis(config.max_retry_after_ms),
        }
    }

    pub fn is_retryable(&self, err: &ProviderError) -> bool {
        match err {
            ProviderError::Parse(_) => false,
            other => match other.status() {
                None => true,
                Some(status) => {
                    status >= 500 || status == 429 || self.retryable_statuses.contains(&status)
                }
            },
        }
    }

    /// Exponential backoff for the given zero-based attempt, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_after(&self, attempt: u32, err: &ProviderError) -> Duration {
        if let Some(explicit) = err.retry_after() {
            return explicit.min(self.max_retry_after);
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// Longest a full retry sequence can take, ignoring rate-gate queuing.
    /// Each wait counts as the larger of the computed backoff and the
    /// retry-after ceiling.
    pub fn worst_case(&self) -> Duration {
        let calls = self.call_timeout.saturating_mul(self.max_attempts);
        let waits = (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| (self.backoff(attempt) + self.jitter).max(self.max_retry_after))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d));
        calls.saturating_add(waits)
    }
}

/// Latest remaining-quota figure reported by the provider.
#[derive(Debug)]
pub struct QuotaTracker {
    remaining: AtomicU64,
    low_water: u64,
}

const QUOTA_UNKNOWN: u64 = u64::MAX;

impl QuotaTracker {
    pub fn new(low_water: u64) -> Self {
        Self {
            remaining: AtomicU64::new(QUOTA_UNKNOWN),
            low_water,
        }
    }

    pub fn observe(&self, meta: &ResponseMeta) {
        let Some(remaining) = meta.remaining_quota else {
            return;
        };
        self.remaining.store(remaining, Ordering::Relaxed);
        if remaining <= self.low_water {
            warn!(remaining, "provider quota running low");
        } else {
            debug!(remaining, "provider quota");
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Relaxed) {
            QUOTA_UNKNOWN => None,
            value => Some(value),
        }
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Runs one logical provider call with rate gating, timeouts and retries.
#[derive(Clone)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
    gate: Option<Arc<RateGate>>,
    quota: Arc<QuotaTracker>,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy, quota: Arc<QuotaTracker>) -> Self {
        Self {
            policy,
            gate: None,
            quota,
        }
    }

    /// Every attempt, retries included, must first pass through `gate`.
    pub fn with_gate(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upper bound on how long `call` can run, including rate-gate waits.
    pub fn budget(&self) -> Duration {
        let gate_wait = self
            .gate
            .as_ref()
            .map(|g| g.settings().max_wait.saturating_mul(self.policy.max_attempts))
            .unwrap_or_default();
        self.policy.worst_case().saturating_add(gate_wait)
    }

    /// Invokes `op` until it succeeds, fails definitively, or runs out of
    /// attempts.
    ///
    /// A rate-gate timeout is returned as is and not retried here.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Metered<T>, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            if let Some(gate) = &self.gate {
                gate.acquire().await?;
            }

            let outcome = match timeout(self.policy.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            let err = match outcome {
                Ok(metered) => {
                    self.quota.observe(&metered.meta);
                    return Ok(metered.value);
                }
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                debug!(call = label, error = %err, "non-retryable provider failure");
                return Err(EngineError::NonRetryable(err));
            }

            attempt += 1;
            if attempt >= self.policy.max_attempts {
                warn!(call = label, attempts = attempt, error = %err, "retries exhausted");
                return Err(EngineError::RetryExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_after(attempt - 1, &err);
            warn!(
                call = label,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider failure, retrying"
            );
            sleep(delay).await;
        }
    }
}
