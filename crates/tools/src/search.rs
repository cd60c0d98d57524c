//! Web search tool backed by the Serper Google Search API.
//!
//! No retries at this layer: a failed search goes back to the model as a
//! tool error so it can rephrase or move on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deepsearch_config::SearchConfig;
use deepsearch_core::error::{RetrievalError, ToolError};
use deepsearch_core::tool::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on the result count the model may ask for.
const MAX_RESULTS: usize = 20;

/// One organic search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
    /// Publication date as reported by the search engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// The search capability used by the `search_web` tool.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(
        &self,
        query: &str,
        num_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RetrievalError>;
}

/// Serper (google.serper.dev) client.
pub struct SerperClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl SerperClient {
    pub fn new(config: &SearchConfig) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RetrievalError::NotConfigured(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    async fn search_inner(&self, query: &str, num_results: usize) -> Result<Vec<SearchResult>, RetrievalError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RetrievalError::NotConfigured("SERPER_API_KEY is not set".into()))?;

        debug!(query, num_results, "Sending search request");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", api_key)
            .json(&json!({ "q": query, "num": num_results }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout(self.timeout_secs)
                } else {
                    RetrievalError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: SerperResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;
        Ok(body.organic.into_iter().take(num_results).collect())
    }
}

#[async_trait]
impl SearchBackend for SerperClient {
    async fn search(
        &self,
        query: &str,
        num_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
            result = self.search_inner(query, num_results) => result,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SearchResult>,
}

/// The `search_web` tool.
pub struct SearchWebTool {
    backend: Arc<dyn SearchBackend>,
    default_results: usize,
}

impl SearchWebTool {
    pub fn new(backend: Arc<dyn SearchBackend>, default_results: usize) -> Self {
        Self {
            backend,
            default_results: default_results.clamp(1, MAX_RESULTS),
        }
    }
}

#[async_trait]
impl Tool for SearchWebTool {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Search the web. Returns a list of results with title, link, snippet and publication date when known."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The query to search the web for"
                },
                "num_results": {
                    "type": "integer",
                    "description": format!("Number of results to return (default {})", self.default_results)
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value, cancel: &CancellationToken) -> Result<Value, ToolError> {
        let query = arguments["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        let num_results = arguments["num_results"]
            .as_u64()
            .map(|n| (n as usize).clamp(1, MAX_RESULTS))
            .unwrap_or(self.default_results);

        let results = self.backend.search(query, num_results, cancel).await?;
        serde_json::to_value(results).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}
