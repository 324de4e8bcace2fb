use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use super::error::ProviderError;
use super::types::{BatchItem, BatchResultItem, CreateBatchRequest, MessageBatch};

const API_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// A backend that can run metadata generation as an asynchronous batch job.
///
/// The orchestrator talks to this trait only, so tests substitute scripted
/// providers and new backends slot in without touching the control loop.
pub trait BatchProvider {
    /// Whether this backend has a batch API at all. A run refuses to submit
    /// through a provider that answers `false`.
    fn supports_batch(&self) -> bool;

    /// Submits `items` as one batch job and returns the created job.
    async fn create_batch_job(&self, items: &[BatchItem]) -> Result<MessageBatch, ProviderError>;

    /// Current status of a batch job.
    async fn get_batch_job(&self, job_id: &str) -> Result<MessageBatch, ProviderError>;

    /// Downloads the per-request results of an ended batch job.
    async fn fetch_results(&self, batch: &MessageBatch) -> Result<Vec<BatchResultItem>, ProviderError>;

    /// Asks the provider to cancel a batch job. Returns whether the job is
    /// now cancelling or already ended.
    async fn cancel_batch_job(&self, job_id: &str) -> Result<bool, ProviderError>;
}

/// Client for the Anthropic Message Batches API.
pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, API_BASE_URL.to_string())
    }

    /// Used by tests to point the client at a mock server.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            api_key,
            client,
            base_url,
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn check(response: Response) -> Result<Response, ProviderError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(DEFAULT_RETRY_AFTER_MS);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

impl BatchProvider for AnthropicClient {
    fn supports_batch(&self) -> bool {
        true
    }

    async fn create_batch_job(&self, items: &[BatchItem]) -> Result<MessageBatch, ProviderError> {
        let url = format!("{}/v1/messages/batches", self.base_url);
        let response = self
            .post(&url)
            .json(&CreateBatchRequest { requests: items })
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<MessageBatch>().await?)
    }

    async fn get_batch_job(&self, job_id: &str) -> Result<MessageBatch, ProviderError> {
        let url = format!("{}/v1/messages/batches/{job_id}", self.base_url);
        let response = self.get(&url).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json::<MessageBatch>().await?)
    }

    async fn fetch_results(&self, batch: &MessageBatch) -> Result<Vec<BatchResultItem>, ProviderError> {
        let url = batch
            .results_url
            .clone()
            .ok_or_else(|| ProviderError::Parse(format!("batch {} has no results_url", batch.id)))?;
        let response = self.get(&url).send().await?;
        let response = Self::check(response).await?;
        let body = response.text().await?;

        // Results arrive as JSON Lines, one outcome per request.
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<BatchResultItem>(line)
                    .map_err(|err| ProviderError::Parse(format!("bad result line: {err}")))
            })
            .collect()
    }

    async fn cancel_batch_job(&self, job_id: &str) -> Result<bool, ProviderError> {
        let url = format!("{}/v1/messages/batches/{job_id}/cancel", self.base_url);
        let response = self.post(&url).send().await?;
        let response = Self::check(response).await?;
        let batch = response.json::<MessageBatch>().await?;
        Ok(matches!(
            batch.processing_status,
            super::types::ProcessingStatus::Canceling | super::types::ProcessingStatus::Ended
        ))
    }
}
