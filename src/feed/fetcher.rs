use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::parser::{parse_feed, ParseError, RawFeedDocument};
use crate::config::FetchConfig;

/// UTF-8 byte order mark, tolerated at the start of a feed body.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Errors that can occur while retrieving a feed document.
///
/// None of these are retried here; the poller tries the feed again on its
/// next turn.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The whole request, including the body read, exceeded the timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Shutdown was requested while the request was in flight.
    #[error("Request cancelled")]
    Cancelled,
    /// Network-level error (DNS, connection, TLS, too many redirects, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the configured size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response body is not valid UTF-8
    #[error("Response body is not valid UTF-8")]
    Decode,
    /// Body is not a well-formed RSS document
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// The HTTP client could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// HTTP client for feed documents.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl FeedFetcher {
    /// Build a fetcher from the `[fetch]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Client`] if the TLS backend cannot be initialized.
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Fetch `url` and parse it as RSS.
    ///
    /// A single GET, bounded end to end by the configured timeout and raced
    /// against `cancel`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Timeout`] / [`FetchError::Cancelled`] if the request did not finish
    /// - [`FetchError::Network`] for connection, TLS or redirect failures
    /// - [`FetchError::HttpStatus`] for non-2xx responses
    /// - [`FetchError::ResponseTooLarge`] above the body size limit
    /// - [`FetchError::Decode`] for a non-UTF-8 body
    /// - [`FetchError::Parse`] for malformed XML or a missing `<channel>`
    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<RawFeedDocument, FetchError> {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.fetch_bytes(url)) => {
                result.map_err(|_| FetchError::Timeout(self.timeout))??
            }
        };

        tracing::debug!(url = %url, bytes = bytes.len(), "Fetched feed body");

        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
        std::str::from_utf8(body).map_err(|_| FetchError::Decode)?;

        Ok(parse_feed(body)?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Network(e)
            }
        })?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, self.max_body_bytes, self.timeout).await
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(timeout)
            } else {
                FetchError::Network(e)
            }
        })?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
