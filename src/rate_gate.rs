//! Shared admission gate in front of one provider endpoint family.
//!
//! Enforces "at most `max_calls` per trailing window" and "at least
//! `min_interval` between calls". One `RateGate` is built at startup and
//! handed to every worker behind an `Arc`; the window is only correct if all
//! callers of the same quota share that single instance.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateGateSettings {
    pub max_calls: u32,
    pub window: Duration,
    pub min_interval: Duration,
    /// Longest a blocking `acquire` may wait in total.
    pub max_wait: Duration,
    /// Most re-checks a blocking `acquire` performs before giving up.
    pub max_retries: u32,
}

impl From<&RateLimitConfig> for RateGateSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_calls: config.max_calls,
            window: Duration::from_millis(config.window_ms),
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_wait: Duration::from_millis(config.max_wait_ms),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    calls: VecDeque<Instant>,
    last_call_at: Option<Instant>,
}

impl RateWindow {
    /// Records a call at `now` if allowed, otherwise returns how long to wait.
    fn admit(&mut self, now: Instant, settings: &RateGateSettings) -> Result<(), Duration> {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= settings.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }

        if self.calls.len() >= settings.max_calls as usize
            && let Some(&oldest) = self.calls.front()
        {
            return Err(settings.window - now.duration_since(oldest));
        }

        if let Some(last) = self.last_call_at {
            let since = now.duration_since(last);
            if since < settings.min_interval {
                return Err(settings.min_interval - since);
            }
        }

        self.calls.push_back(now);
        self.last_call_at = Some(now);
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateGate {
    settings: RateGateSettings,
    window: Mutex<RateWindow>,
}

impl RateGate {
    pub fn new(settings: RateGateSettings) -> Self {
        Self {
            settings,
            window: Mutex::new(RateWindow::default()),
        }
    }

    pub fn settings(&self) -> &RateGateSettings {
        &self.settings
    }

    /// Takes a call slot if one is free right now.
    pub fn try_acquire(&self) -> Result<(), EngineError> {
        self.window
            .lock()
            .admit(Instant::now(), &self.settings)
            .map_err(|_| EngineError::RateLimitTimeout { waited_ms: 0 })
    }

    /// Waits for a call slot, re-checking after each capped sleep.
    ///
    /// Fails with [`EngineError::RateLimitTimeout`] once `max_wait` has
    /// elapsed or `max_retries` re-checks were spent.
    pub async fn acquire(&self) -> Result<(), EngineError> {
        let started = Instant::now();
        let mut rechecks = 0u32;

        loop {
            let wait = match self.window.lock().admit(Instant::now(), &self.settings) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let elapsed = started.elapsed();
            if rechecks >= self.settings.max_retries || elapsed >= self.settings.max_wait {
                return Err(EngineError::RateLimitTimeout {
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            let nap = wait.min(self.settings.max_wait - elapsed);
            rechecks += 1;
            debug!(
                wait_ms = nap.as_millis() as u64,
                recheck = rechecks,
                "waiting for provider call slot"
            );
            sleep(nap).await;
        }
    }

    /// Calls currently counted against the window.
    pub fn in_window(&self) -> usize {
        let mut window = self.window.lock();
        let now = Instant::now();
        let span = self.settings.window;
        window.calls.retain(|t| now.duration_since(*t) < span);
        window.calls.len()
    }
}
