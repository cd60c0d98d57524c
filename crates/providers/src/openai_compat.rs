//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, and any endpoint exposing
//! `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling, with tool outcomes replayed from message parts
//! - Cancellation of in-flight requests and streams

use std::collections::BTreeMap;

use async_trait::async_trait;
use deepsearch_core::error::ProviderError;
use deepsearch_core::message::{InvocationState, Message, Role, ToolInvocation};
use deepsearch_core::provider::*;
use deepsearch_core::tool::ToolCall;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Convert our history to OpenAI API format.
    ///
    /// Tool invocations carried in message parts are expanded into an
    /// assistant `tool_calls` entry followed by one `tool` message per call.
    fn to_api_messages(system: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            out.push(ApiMessage::text("system", system));
        }

        for m in messages {
            let invocations: Vec<&ToolInvocation> = m.tool_invocations().collect();
            match m.role {
                Role::User => out.push(ApiMessage::text("user", &m.text())),
                Role::Assistant if invocations.is_empty() => {
                    out.push(ApiMessage::text("assistant", &m.text()));
                }
                Role::Tool if invocations.is_empty() => {
                    trace!(message_id = %m.id, "Skipping tool message without invocations");
                }
                Role::Assistant | Role::Tool => {
                    let text = m.text();
                    out.push(ApiMessage {
                        role: "assistant".into(),
                        content: (!text.is_empty()).then_some(text),
                        tool_calls: Some(
                            invocations
                                .iter()
                                .map(|inv| ApiToolCall {
                                    id: inv.call_id.clone(),
                                    r#type: "function".into(),
                                    function: ApiFunction {
                                        name: inv.tool_name.clone(),
                                        arguments: inv.args.to_string(),
                                    },
                                })
                                .collect(),
                        ),
                        tool_call_id: None,
                    });
                    for inv in invocations {
                        out.push(ApiMessage {
                            role: "tool".into(),
                            content: Some(outcome_content(&inv.state)),
                            tool_calls: None,
                            tool_call_id: Some(inv.call_id.clone()),
                        });
                    }
                }
            }
        }
        out
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request.system.as_deref(), &request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }

    /// Send the request, racing it against `cancel`, and map HTTP failures.
    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
        cancel: &CancellationToken,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            result = builder.send() => result.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?,
        };

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

/// The `tool` message body replayed to the model for one invocation.
fn outcome_content(state: &InvocationState) -> String {
    match state {
        InvocationState::Result { result } => result.to_string(),
        InvocationState::Error { error } => serde_json::json!({ "error": error }).to_string(),
        InvocationState::Pending => {
            serde_json::json!({ "error": "Tool call did not complete" }).to_string()
        }
    }
}

/// Parse raw argument text into JSON. Malformed JSON is passed through as a
/// string so the tool can report it.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[async_trait]
impl deepsearch_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.send(&body, false, cancel).await?;

        let api_response: ApiResponse = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            parsed = response.json() => parsed.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?,
        };

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                })?;

        let invocations = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolInvocation {
                call_id: tc.id,
                tool_name: tc.function.name,
                args: parse_arguments(&tc.function.arguments),
                state: InvocationState::Pending,
            })
            .collect();

        let message =
            Message::assistant_step(choice.message.content.unwrap_or_default(), invocations);

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ProviderResponse {
            message,
            usage,
            model: api_response.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let body = Self::request_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.send(&body, true, cancel).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();
        let cancel = cancel.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = SseParser::default();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(ProviderError::Cancelled)).await;
                        return;
                    }
                    next = byte_stream.next() => next,
                };

                let Some(chunk_result) = next else { break };
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for chunk in parser.feed(&bytes, &provider_name) {
                    let done = chunk.done;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return; // receiver dropped
                    }
                    if done {
                        return;
                    }
                }
            }

            // Stream ended without [DONE]: send final chunk
            let _ = tx.send(Ok(parser.finish(None))).await;
        });

        Ok(rx)
    }
}

/// Incremental parser for the chat-completions SSE stream.
#[derive(Default)]
struct SseParser {
    /// Raw bytes not yet terminated by a newline. Kept undecoded so a
    /// character split across reads is decoded whole.
    buffer: Vec<u8>,
    /// Tool call deltas keyed by the model's call index, so calls come out
    /// in the order the model issued them.
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl SseParser {
    /// Consume raw bytes and return the chunks they complete. A `done`
    /// chunk, if any, is always last.
    fn feed(&mut self, bytes: &[u8], provider_name: &str) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();

        // Process complete lines
        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            // "[DONE]" signals end of stream
            if data == "[DONE]" {
                chunks.push(self.finish(None));
                return chunks;
            }

            let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
                Ok(r) => r,
                Err(e) => {
                    trace!(
                        provider = %provider_name,
                        data = %data,
                        error = %e,
                        "Ignoring unparseable SSE chunk"
                    );
                    continue;
                }
            };

            if let Some(choice) = stream_resp.choices.first() {
                let delta = &choice.delta;

                // Accumulate tool call deltas
                for tc_delta in delta.tool_calls.iter().flatten() {
                    let acc = self.tool_calls.entry(tc_delta.index).or_default();
                    if let Some(ref id) = tc_delta.id {
                        acc.id = id.clone();
                    }
                    if let Some(ref func) = tc_delta.function {
                        if let Some(ref name) = func.name {
                            acc.name = name.clone();
                        }
                        if let Some(ref args) = func.arguments {
                            acc.arguments.push_str(args);
                        }
                    }
                }

                if delta.content.as_ref().is_some_and(|c| !c.is_empty()) {
                    chunks.push(StreamChunk {
                        content: delta.content.clone(),
                        ..StreamChunk::default()
                    });
                }
            }

            // Usage arrives in the final chunk when stream_options asks for it
            if let Some(usage) = stream_resp.usage {
                chunks.push(self.finish(Some(Usage {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                })));
                return chunks;
            }
        }

        chunks
    }

    /// Build the closing chunk carrying every accumulated tool call.
    fn finish(&mut self, usage: Option<Usage>) -> StreamChunk {
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(ToolCallAccumulator::into_tool_call)
            .collect();
        StreamChunk {
            content: None,
            tool_calls,
            done: true,
            usage,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> ToolCall {
        ToolCall {
            arguments: parse_arguments(&self.arguments),
            id: self.id,
            name: self.name,
        }
    }
}
