use thiserror::Error;

/// Errors returned by provider clients.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider asked us to back off. `retry_after_ms` comes from the
    /// `retry-after` header when present, otherwise a default.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Non-success HTTP response with the body the provider sent back.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response arrived but could not be interpreted.
    #[error("unexpected provider response: {0}")]
    Parse(String),
}
