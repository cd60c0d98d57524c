//! Provider trait: the abstraction over the language model.
//!
//! A Provider knows how to send a conversation plus the tool registry to a
//! model and get back text and tool-call requests, either as a complete
//! message or as a stream of deltas.
//!
//! Implementations: OpenAI-compatible endpoints (OpenRouter, OpenAI, Ollama).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::ToolCall;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "openai/gpt-4o-mini")
    pub model: String,

    /// System instructions sent ahead of the history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message; tool calls appear as pending invocations
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Completed tool call requests, in the order the model issued them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The core Provider trait.
///
/// The agent loop calls `stream()` without knowing which backend is in use.
/// Both methods observe `cancel`: once it fires they stop talking to the
/// backend and return [`ProviderError::Cancelled`] (or close the stream).
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request, cancel).await?;
        let tool_calls = response
            .message
            .tool_invocations()
            .map(|inv| ToolCall {
                id: inv.call_id.clone(),
                name: inv.tool_name.clone(),
                arguments: inv.args.clone(),
            })
            .collect();
        let text = response.message.text();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: (!text.is_empty()).then_some(text),
                tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }
}
