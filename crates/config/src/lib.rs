//! Configuration loading, validation, and management for deepsearch.
//!
//! Loads configuration from `~/.deepsearch/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.deepsearch/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Turn orchestration settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Web search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Page crawl settings
    #[serde(default)]
    pub crawl: CrawlConfig,

    /// Conversation store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("search", &self.search)
            .field("crawl", &self.crawl)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("api_key", &redact(&self.api_key))
            .field("endpoint", &self.endpoint)
            .field("num_results", &self.num_results)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for UserToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserToken")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on generate→tools iterations per turn
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Replaces the built-in research prompt when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Conversation titles are cut to this many characters
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
}

fn default_max_steps() -> usize {
    10
}
fn default_title_max_chars() -> usize {
    50
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: None,
            title_max_chars: default_title_max_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Result count used when the model does not ask for one
    #[serde(default = "default_num_results")]
    pub num_results: usize,

    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".into()
}
fn default_num_results() -> usize {
    10
}
fn default_search_timeout() -> u64 {
    15
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_search_endpoint(),
            num_results: default_num_results(),
            timeout_secs: default_search_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Total fetch attempts per URL, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// URLs fetched at the same time within one crawl
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_crawl_timeout")]
    pub timeout_secs: u64,

    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Response bodies larger than this are truncated
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Extracted text longer than this is truncated
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_concurrency() -> usize {
    4
}
fn default_crawl_timeout() -> u64 {
    20
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_max_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_max_text_chars() -> usize {
    20_000
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            timeout_secs: default_crawl_timeout(),
            retry_delay_ms: default_retry_delay_ms(),
            max_bytes: default_max_bytes(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx connection string; `sqlite::memory:` keeps everything in RAM
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_database_url() -> String {
    let path = AppConfig::config_dir().join("deepsearch.db");
    format!("sqlite://{}", path.display())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Bearer tokens accepted by the gateway and the user each one maps to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserToken>,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            users: Vec::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserToken {
    pub token: String,
    pub user_id: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.deepsearch/config.toml).
    ///
    /// Also checks environment variables:
    /// - `DEEPSEARCH_API_KEY` (highest priority), `OPENROUTER_API_KEY`, `OPENAI_API_KEY`
    /// - `SERPER_API_KEY` for web search
    /// - `DEEPSEARCH_PROVIDER`, `DEEPSEARCH_MODEL`, `DEEPSEARCH_DATABASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("DEEPSEARCH_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }

        if self.search.api_key.is_none() {
            self.search.api_key = lookup("SERPER_API_KEY");
        }

        if let Some(provider) = lookup("DEEPSEARCH_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("DEEPSEARCH_MODEL") {
            self.default_model = model;
        }

        if let Some(url) = lookup("DEEPSEARCH_DATABASE_URL") {
            self.store.database_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".deepsearch")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }

        if self.agent.title_max_chars == 0 {
            return Err(ConfigError::ValidationError(
                "agent.title_max_chars must be at least 1".into(),
            ));
        }

        if self.crawl.max_attempts == 0 || self.crawl.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "crawl.max_attempts and crawl.concurrency must be at least 1".into(),
            ));
        }

        let mut tokens = std::collections::HashSet::new();
        for user in &self.gateway.users {
            if user.token.is_empty() || user.user_id.is_empty() {
                return Err(ConfigError::ValidationError(
                    "gateway.users entries need a token and a user_id".into(),
                ));
            }
            if !tokens.insert(user.token.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "gateway token for user '{}' is not unique",
                    user.user_id
                )));
            }
        }

        Ok(())
    }

    /// Check if a model API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            search: SearchConfig::default(),
            crawl: CrawlConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
