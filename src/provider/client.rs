use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use super::ProviderClient;
use super::error::ProviderError;
use super::types::{Metered, ResponseMeta, StatusResponse, SubmitRequest, SubmitResponse};

const QUOTA_HEADERS: [&str; 3] = [
    "x-quota-remaining",
    "x-ratelimit-remaining",
    "x-credits-remaining",
];

/// Live client for the provider's HTTP task API.
pub struct HttpProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

impl HttpProvider {
    pub fn new(
        api_key: String,
        base_url: String,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<Metered<T>, ProviderError> {
        let meta = read_meta(response.headers());
        let response = Self::check_status(response, meta).await?;
        let body = response.bytes().await?;
        let value = serde_json::from_slice::<T>(&body)?;
        Ok(Metered::new(value, meta))
    }

    async fn check_status(response: Response, meta: ResponseMeta) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(ProviderError::Status {
            status: status.as_u16(),
            message,
            retry_after: meta.retry_after,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn submit(&self, req: &SubmitRequest) -> Result<Metered<SubmitResponse>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/tasks", self.base_url))
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn status(&self, task_id: &str) -> Result<Metered<StatusResponse>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v1/tasks/{task_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn download(&self, url: &str) -> Result<Metered<Vec<u8>>, ProviderError> {
        let response = self.client.get(url).send().await?;
        let meta = read_meta(response.headers());
        let response = Self::check_status(response, meta).await?;
        let bytes = response.bytes().await?;
        Ok(Metered::new(bytes.to_vec(), meta))
    }
}

/// Reads quota and retry-after signals. Malformed values are ignored.
pub(crate) fn read_meta(headers: &HeaderMap) -> ResponseMeta {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let remaining_quota = QUOTA_HEADERS
        .iter()
        .find_map(|name| header_str(name).and_then(|v| v.trim().parse::<u64>().ok()));

    // Only the delta-seconds form is honored; HTTP-dates are ignored.
    let retry_after = header_str("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);

    ResponseMeta {
        remaining_quota,
        retry_after,
    }
}
