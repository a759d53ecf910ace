pub mod client;
pub mod error;
pub mod fixture;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use client::HttpProvider;
pub use error::ProviderError;
pub use fixture::FixtureProvider;
pub use types::{
    Metered, ResponseMeta, StatusResponse, SubmitRequest, SubmitResponse, TaskResult, TaskStatus,
};

use crate::config::{ProviderConfig, ProviderMode};
use crate::error::EngineError;

/// The external imaging provider's task API.
///
/// Implementations perform exactly one outbound call per method; retries,
/// rate limiting and polling live in the engine.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn submit(&self, req: &SubmitRequest) -> Result<Metered<SubmitResponse>, ProviderError>;

    async fn status(&self, task_id: &str) -> Result<Metered<StatusResponse>, ProviderError>;

    /// Fetches a result that was delivered by URL rather than inline.
    async fn download(&self, url: &str) -> Result<Metered<Vec<u8>>, ProviderError>;
}

/// Builds the provider selected by configuration. The choice is made once
/// here; nothing downstream branches on the mode.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn ProviderClient>, EngineError> {
    match config.mode {
        ProviderMode::Fixture => Ok(Arc::new(FixtureProvider::new())),
        ProviderMode::Live => {
            if config.api_key.is_empty() {
                return Err(EngineError::Config(
                    "provider.api_key (or ATELIER_API_KEY) is required in live mode".into(),
                ));
            }
            let provider = HttpProvider::new(
                config.api_key.clone(),
                config.base_url.clone(),
                Duration::from_millis(config.connect_timeout_ms),
                Duration::from_millis(config.request_timeout_ms),
            )
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;
            Ok(Arc::new(provider))
        }
    }
}
