//! Remote bot-signature document.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// Why a signature fetch failed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("document is not a JSON array")]
    NotAnArray,

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Provider of the raw signature document.
#[async_trait]
pub trait PatternSource: Send + Sync {
    /// Fetch the document's elements, unparsed.
    async fn fetch(&self) -> Result<Vec<serde_json::Value>, SourceError>;
}

/// Fetches the signature document over HTTP.
pub struct HttpPatternSource {
    client: Client,
    url: String,
}

impl HttpPatternSource {
    /// Create a source for `url` with a per-request time budget.
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("zentinel-bot-gate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PatternSource for HttpPatternSource {
    async fn fetch(&self) -> Result<Vec<serde_json::Value>, SourceError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body = response.bytes().await?;
        parse_document(&body)
    }
}

/// Parse a signature document, which must be a JSON array.
pub fn parse_document(body: &[u8]) -> Result<Vec<serde_json::Value>, SourceError> {
    match serde_json::from_slice(body)? {
        serde_json::Value::Array(items) => Ok(items),
        _ => Err(SourceError::NotAnArray),
    }
}
