//! Services the engine depends on but does not own: the job store, the
//! blob store and user notifications.
//!
//! Each is a trait so deployments can plug in their own persistence. The
//! in-memory implementations here back the CLI and the tests.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::job::{Job, JobPatch};

/// Opaque reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef(pub String);

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), EngineError>;

    /// Applies `patch` and returns the updated record.
    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, EngineError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, EngineError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
    -> Result<BlobRef, EngineError>;

    async fn signed_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String, EngineError>;
}

/// Terminal events users are told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    JobSucceeded,
    JobFailed,
}

/// Fire-and-forget user notification. Errors are logged by the caller and
/// never change a job's outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account_id: &str, event: JobEvent, payload: Value)
    -> Result<(), EngineError>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<(), EngineError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(EngineError::Storage(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, EngineError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        job.apply(patch);
        Ok(job.clone())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, EngineError> {
        Ok(self.jobs.read().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes and content type for `blob`.
    pub fn get(&self, blob: &BlobRef) -> Option<(Vec<u8>, String)> {
        self.blobs.read().get(&blob.0).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<BlobRef, EngineError> {
        self.blobs
            .write()
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(BlobRef(key.to_string()))
    }

    async fn signed_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String, EngineError> {
        if !self.blobs.read().contains_key(&blob.0) {
            return Err(EngineError::Storage(format!("no blob at {blob}")));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("memory://{}?expires={expires}", blob.0))
    }
}

/// Notifier that only writes a log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        account_id: &str,
        event: JobEvent,
        payload: Value,
    ) -> Result<(), EngineError> {
        info!(account_id, ?event, %payload, "notification");
        Ok(())
    }
}

/// Notifier that keeps every event, for the demo summary and tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, JobEvent, Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, JobEvent, Value)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        account_id: &str,
        event: JobEvent,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.events
            .lock()
            .push((account_id.to_string(), event, payload));
        Ok(())
    }
}
