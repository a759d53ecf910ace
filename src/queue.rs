//! Tiered job queue.
//!
//! Each [`Tier`] is its own FIFO lane. Workers that do not care about the
//! tier call [`JobQueue::next`], which serves lanes by weighted round-robin
//! so the normal lane keeps getting a share while the high lane is busy.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::job::{Job, JobStatus, Tier};

const LANES: usize = Tier::ALL.len();

struct Tracked {
    status: JobStatus,
    finished_at: Option<Instant>,
    remove_after: Duration,
}

struct QueueState {
    lanes: [VecDeque<Job>; LANES],
    tracked: HashMap<Uuid, Tracked>,
    cursor: usize,
    served: u32,
    closed: bool,
}

impl QueueState {
    fn pick(&mut self, weights: &[u32; LANES]) -> Option<Job> {
        // Every lane gets a fresh turn within LANES + 1 steps.
        for _ in 0..=LANES {
            let lane = self.cursor;
            if self.served < weights[lane]
                && let Some(job) = self.lanes[lane].pop_front()
            {
                self.served += 1;
                return Some(job);
            }
            self.cursor = (self.cursor + 1) % LANES;
            self.served = 0;
        }
        None
    }

    fn mark_running(&mut self, job: &Job) {
        if let Some(tracked) = self.tracked.get_mut(&job.id) {
            tracked.status = JobStatus::Running;
        }
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    weights: [u32; LANES],
}

impl JobQueue {
    /// `high_weight` and `normal_weight` are how many jobs each lane may
    /// hand out per round. Zero is treated as one.
    pub fn new(high_weight: u32, normal_weight: u32) -> Self {
        Self {
            state: Mutex::new(QueueState {
                lanes: Default::default(),
                tracked: HashMap::new(),
                cursor: 0,
                served: 0,
                closed: false,
            }),
            notify: Notify::new(),
            weights: [high_weight.max(1), normal_weight.max(1)],
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.high_weight, config.normal_weight)
    }

    /// Appends a job to the lane of its own tier.
    pub fn enqueue(&self, job: Job) -> Result<(), EngineError> {
        let tier = job.tier;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::QueueClosed);
            }
            state.tracked.insert(
                job.id,
                Tracked {
                    status: JobStatus::Queued,
                    finished_at: None,
                    remove_after: job.policy.remove_after(),
                },
            );
            debug!(job_id = %job.id, %tier, depth = state.lanes[tier.index()].len() + 1, "job enqueued");
            state.lanes[tier.index()].push_back(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Puts an admitted job back at the front of its lane. Allowed after
    /// `close`: a closed queue refuses new work but still drains retries.
    pub fn requeue(&self, job: Job) {
        {
            let mut state = self.state.lock();
            if let Some(tracked) = state.tracked.get_mut(&job.id) {
                tracked.status = JobStatus::Queued;
            }
            state.lanes[job.tier.index()].push_front(job);
        }
        self.notify.notify_waiters();
    }

    /// Next job from one lane, waiting until one arrives. `None` once the
    /// queue is closed and the lane is empty.
    pub async fn dequeue(&self, tier: Tier) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(job) = state.lanes[tier.index()].pop_front() {
                    state.mark_running(&job);
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Next job from any lane by weighted round-robin, waiting until one
    /// arrives. `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(job) = state.pick(&self.weights) {
                    state.mark_running(&job);
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let job = state.pick(&self.weights)?;
        state.mark_running(&job);
        Some(job)
    }

    pub fn complete(&self, job_id: Uuid, status: JobStatus) {
        let mut state = self.state.lock();
        if let Some(tracked) = state.tracked.get_mut(&job_id) {
            tracked.status = status;
            if status.is_terminal() {
                tracked.finished_at = Some(Instant::now());
            }
        }
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.state.lock().tracked.get(&job_id).map(|t| t.status)
    }

    /// Drops terminal jobs whose retention has passed. Returns how many.
    pub fn prune_terminal(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.tracked.len();
        state.tracked.retain(|_, t| match t.finished_at {
            Some(at) => now.saturating_duration_since(at) < t.remove_after,
            None => true,
        });
        before - state.tracked.len()
    }

    pub fn depth(&self, tier: Tier) -> usize {
        self.state.lock().lanes[tier.index()].len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting work. Waiting consumers drain what is left and then
    /// receive `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
