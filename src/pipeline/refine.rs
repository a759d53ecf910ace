//! Local refinement passes.
//!
//! Passes are pure functions over an [`Artifact`]. They run on the blocking
//! pool, so a CPU-heavy pass never stalls the async workers. Any failure,
//! including a panic or a name nobody registered, only degrades the output.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CONTENT_DIGEST: &str = "content-digest";
pub const SIZE_GUARD: &str = "size-guard";
pub const STRIP_METADATA: &str = "strip-metadata";

/// Metadata prefix for keys copied from the provider response.
pub const PROVIDER_PREFIX: &str = "provider.";

/// Bytes flowing between pipeline steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefineError {
    #[error("unknown refinement pass: {0}")]
    UnknownPass(String),

    #[error("{0}")]
    Rejected(String),

    #[error("refinement pass panicked")]
    Panicked,
}

pub trait Refiner: Send + Sync {
    fn name(&self) -> &'static str;

    fn refine(&self, input: &Artifact, params: &Value) -> Result<Artifact, RefineError>;
}

/// Records the SHA-256 of the bytes under `sha256`.
pub struct ContentDigest;

impl Refiner for ContentDigest {
    fn name(&self) -> &'static str {
        CONTENT_DIGEST
    }

    fn refine(&self, input: &Artifact, _params: &Value) -> Result<Artifact, RefineError> {
        let digest = hex::encode(Sha256::digest(&input.bytes));
        Ok(input.clone().with_metadata("sha256", digest))
    }
}

/// Rejects empty artifacts and ones larger than `max_bytes`. A
/// `max_bytes` param overrides the configured limit.
pub struct SizeGuard {
    max_bytes: usize,
}

impl SizeGuard {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Refiner for SizeGuard {
    fn name(&self) -> &'static str {
        SIZE_GUARD
    }

    fn refine(&self, input: &Artifact, params: &Value) -> Result<Artifact, RefineError> {
        let limit = params
            .get("max_bytes")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.max_bytes);

        if input.bytes.is_empty() {
            return Err(RefineError::Rejected("artifact is empty".into()));
        }
        if input.bytes.len() > limit {
            return Err(RefineError::Rejected(format!(
                "artifact is {} bytes, limit is {limit}",
                input.bytes.len()
            )));
        }
        Ok(input.clone().with_metadata("size", input.bytes.len().to_string()))
    }
}

/// Drops provider-internal metadata before the artifact is stored.
pub struct StripMetadata;

impl Refiner for StripMetadata {
    fn name(&self) -> &'static str {
        STRIP_METADATA
    }

    fn refine(&self, input: &Artifact, _params: &Value) -> Result<Artifact, RefineError> {
        let mut out = input.clone();
        out.metadata.retain(|key, _| !key.starts_with(PROVIDER_PREFIX));
        Ok(out)
    }
}

#[derive(Clone, Default)]
pub struct RefinerRegistry {
    passes: HashMap<String, Arc<dyn Refiner>>,
}

impl RefinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(max_bytes: usize) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ContentDigest));
        registry.register(Arc::new(SizeGuard::new(max_bytes)));
        registry.register(Arc::new(StripMetadata));
        registry
    }

    pub fn register(&mut self, refiner: Arc<dyn Refiner>) {
        self.passes.insert(refiner.name().to_string(), refiner);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Refiner>, RefineError> {
        self.passes
            .get(name)
            .cloned()
            .ok_or_else(|| RefineError::UnknownPass(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.passes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
