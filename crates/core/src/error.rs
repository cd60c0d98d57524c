//! Error types for the deepsearch domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all deepsearch operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the model capability. Always fatal to a turn.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Generation cancelled")]
    Cancelled,
}

/// Failures of the conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The conversation exists but belongs to someone else. No writes happened.
    #[error("Conversation {conversation_id} is owned by another user")]
    OwnershipViolation { conversation_id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Failures of an external retrieval capability (search or page fetch).
///
/// These are typed reasons, not fatal errors: the crawl adapter records them
/// per URL and the search adapter hands them back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Retrieval not configured: {0}")]
    NotConfigured(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Failures of a single tool invocation. Never fatal to a turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
}
