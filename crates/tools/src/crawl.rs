//! Bulk crawl tool: fetch many pages at once, tolerate partial failure.
//!
//! Every requested URL (duplicates included) is fetched independently with
//! its own retry budget. The report always carries one entry per URL so the
//! model can use whatever succeeded even when the batch as a whole failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deepsearch_config::CrawlConfig;
use deepsearch_core::error::{RetrievalError, ToolError};
use deepsearch_core::tool::Tool;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fetch::PageFetcher;
use crate::retry::{RetryPolicy, retry_all};

/// Outcome for a single requested URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlEntry {
    pub url: String,
    pub outcome: Result<String, RetrievalError>,
    pub attempts: u32,
}

/// Aggregate outcome of a bulk crawl.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    /// True only when every URL eventually succeeded
    pub success: bool,
    /// One entry per requested URL, in request order
    pub entries: Vec<CrawlEntry>,
    /// Human-readable summary of the failures, if any
    pub error: Option<String>,
}

impl CrawlReport {
    fn from_entries(entries: Vec<CrawlEntry>) -> Self {
        let failed: Vec<String> = entries
            .iter()
            .filter_map(|e| e.outcome.as_ref().err().map(|err| format!("{} ({err})", e.url)))
            .collect();
        let error = (!failed.is_empty()).then(|| {
            format!(
                "Failed to crawl {} of {} URLs: {}",
                failed.len(),
                entries.len(),
                failed.join("; ")
            )
        });
        Self {
            success: failed.is_empty(),
            entries,
            error,
        }
    }

    /// The payload handed back to the model.
    ///
    /// Full success is a plain list of `{url, content}`. Anything else is
    /// `{error, partialResults}` where each entry says whether it succeeded
    /// and carries either the content or the failure reason.
    pub fn to_payload(&self) -> Value {
        if self.success {
            return Value::Array(
                self.entries
                    .iter()
                    .map(|e| json!({ "url": e.url, "content": e.outcome.as_ref().ok() }))
                    .collect(),
            );
        }

        let partial: Vec<Value> = self
            .entries
            .iter()
            .map(|e| match &e.outcome {
                Ok(content) => json!({ "url": e.url, "success": true, "content": content }),
                Err(err) => json!({ "url": e.url, "success": false, "content": err.to_string() }),
            })
            .collect();
        json!({ "error": self.error, "partialResults": partial })
    }
}

/// Crawl `urls` concurrently, retrying each one per `policy`.
pub async fn bulk_crawl(
    fetcher: &dyn PageFetcher,
    urls: Vec<String>,
    concurrency: usize,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> CrawlReport {
    let attempted = retry_all(urls.clone(), concurrency, policy, cancel, |url: String| async move {
        fetcher.fetch(&url, cancel).await
    })
    .await;

    let entries = urls
        .into_iter()
        .zip(attempted)
        .map(|(url, a)| CrawlEntry {
            url,
            outcome: a.outcome,
            attempts: a.attempts,
        })
        .collect();
    CrawlReport::from_entries(entries)
}

/// The `scrape_pages` tool.
pub struct ScrapePagesTool {
    fetcher: Arc<dyn PageFetcher>,
    concurrency: usize,
    policy: RetryPolicy,
}

impl ScrapePagesTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: &CrawlConfig) -> Self {
        Self {
            fetcher,
            concurrency: config.concurrency,
            policy: RetryPolicy::new(config.max_attempts, Duration::from_millis(config.retry_delay_ms)),
        }
    }
}

#[async_trait]
impl Tool for ScrapePagesTool {
    fn name(&self) -> &str {
        "scrape_pages"
    }

    fn description(&self) -> &str {
        "Fetch the full text content of web pages. Use this after search_web on the most relevant result links."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "The URLs to scrape"
                }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, arguments: Value, cancel: &CancellationToken) -> Result<Value, ToolError> {
        let urls: Vec<String> = arguments["urls"]
            .as_array()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'urls' argument".into()))?
            .iter()
            .map(|u| {
                u.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ToolError::InvalidArguments("'urls' must contain strings".into()))
            })
            .collect::<Result<_, _>>()?;

        if urls.is_empty() {
            return Err(ToolError::InvalidArguments("'urls' must not be empty".into()));
        }

        let report = bulk_crawl(
            self.fetcher.as_ref(),
            urls,
            self.concurrency,
            &self.policy,
            cancel,
        )
        .await;

        if report.success {
            info!(pages = report.entries.len(), "Crawl complete");
        } else {
            warn!(error = report.error.as_deref().unwrap_or_default(), "Crawl partially failed");
        }
        Ok(report.to_payload())
    }
}
