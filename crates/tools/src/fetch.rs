//! Page fetching: one URL in, readable text out.
//!
//! Limits:
//! - Hard timeout per request
//! - Redirect limit (5 hops)
//! - Body size cap (larger bodies are truncated)
//! - Extracted text cap

use std::time::Duration;

use async_trait::async_trait;
use deepsearch_config::CrawlConfig;
use deepsearch_core::error::RetrievalError;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use tokio_util::sync::CancellationToken;

use crate::html::html_to_text;

/// The page-fetch capability used by the crawl tool.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `url` and return its readable content.
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, RetrievalError>;
}

/// Fetches pages over HTTP with reqwest.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    timeout_secs: u64,
    max_bytes: usize,
    max_text_chars: usize,
}

impl HttpPageFetcher {
    pub fn new(config: &CrawlConfig) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| RetrievalError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs: config.timeout_secs,
            max_bytes: config.max_bytes,
            max_text_chars: config.max_text_chars,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> RetrievalError {
        if e.is_timeout() {
            RetrievalError::Timeout(self.timeout_secs)
        } else {
            RetrievalError::Network(e.to_string())
        }
    }

    async fn fetch_inner(&self, url: &str) -> Result<String, RetrievalError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| RetrievalError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RetrievalError::InvalidUrl(format!(
                "{url}: unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let resp = self
            .client
            .get(parsed)
            .header(USER_AGENT, concat!("deepsearch/", env!("CARGO_PKG_VERSION")))
            .header("Accept", "text/html,application/xhtml+xml,text/plain,application/json")
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RetrievalError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("request failed").to_string(),
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        // Stream body with hard byte cap
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_send_error(e))?;
            let room = self.max_bytes.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if buf.len() >= self.max_bytes {
                tracing::debug!(url, max_bytes = self.max_bytes, "Truncating oversized page");
                break;
            }
        }

        let body = String::from_utf8_lossy(&buf);
        let text = if content_type.contains("html") {
            html_to_text(&body, self.max_text_chars)
        } else if content_type.is_empty()
            || content_type.starts_with("text/")
            || content_type.contains("json")
        {
            body.chars().take(self.max_text_chars).collect()
        } else {
            return Err(RetrievalError::InvalidResponse(format!(
                "unsupported content type '{content_type}'"
            )));
        };

        if text.trim().is_empty() {
            return Err(RetrievalError::InvalidResponse("page has no readable text".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, RetrievalError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
            result = self.fetch_inner(url) => result,
        }
    }
}
