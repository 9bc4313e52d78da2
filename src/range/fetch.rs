use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;

use crate::error::{Error, Result};

/// Network side of the byte range cache.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Total size of the resource, from a `HEAD` request.
    async fn content_length(&self, url: &str) -> Result<u64>;

    /// Bytes `start..end` of the resource.
    async fn fetch(&self, url: &str, start: u64, end: u64) -> Result<Bytes>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl RangeFetcher for HttpFetcher {
    async fn content_length(&self, url: &str) -> Result<u64> {
        let response = self
            .client
            .head(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NOT_MODIFIED {
            tracing::warn!(url = %url, status = status.as_u16(), "size lookup failed");
            return Err(Error::MissingContentLength {
                url: url.to_string(),
            });
        }

        // reqwest reports a zero body size for HEAD, read the header itself.
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::MissingContentLength {
                url: url.to_string(),
            })
    }

    async fn fetch(&self, url: &str, start: u64, end: u64) -> Result<Bytes> {
        if end <= start {
            return Ok(Bytes::new());
        }

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::FetchFailure {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.len() as u64 != end - start {
            tracing::warn!(
                url = %url,
                start,
                end,
                received = bytes.len(),
                "short range response"
            );
            return Err(Error::FetchFailure {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::trace!(url = %url, start, end, "fetched range");
        Ok(bytes)
    }
}
