//! Retrieval tools for deepsearch.
//!
//! Two tools are exposed to the model:
//! - `search_web`: one query in, an ordered list of search hits out
//! - `scrape_pages`: many URLs in, per-URL page text or failure reason out,
//!   with each URL retried independently

pub mod crawl;
pub mod fetch;
pub mod html;
pub mod retry;
pub mod search;

use std::sync::Arc;

use deepsearch_config::AppConfig;
use deepsearch_core::error::RetrievalError;
use deepsearch_core::tool::ToolRegistry;

pub use crawl::{CrawlEntry, CrawlReport, ScrapePagesTool, bulk_crawl};
pub use fetch::{HttpPageFetcher, PageFetcher};
pub use retry::{Attempted, RetryPolicy, retry_all};
pub use search::{SearchBackend, SearchResult, SearchWebTool, SerperClient};

/// Create the registry the agent loop runs with: `search_web` backed by
/// Serper and `scrape_pages` backed by the HTTP fetcher.
pub fn default_registry(config: &AppConfig) -> Result<ToolRegistry, RetrievalError> {
    let search = Arc::new(SerperClient::new(&config.search)?);
    let fetcher = Arc::new(HttpPageFetcher::new(&config.crawl)?);
    Ok(registry_with(search, fetcher, config))
}

/// Build the registry around caller-supplied backends.
pub fn registry_with(
    search: Arc<dyn SearchBackend>,
    fetcher: Arc<dyn PageFetcher>,
    config: &AppConfig,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(SearchWebTool::new(search, config.search.num_results)));
    registry.register(Box::new(ScrapePagesTool::new(fetcher, &config.crawl)));
    registry
}
