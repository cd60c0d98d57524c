//! Tool trait: the abstraction over retrieval capabilities.
//!
//! Tools are what let the model look things up while answering:
//! search the web, crawl pages, etc.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::message::{InvocationState, ToolInvocation};
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Attach an outcome to this call.
    pub fn into_invocation(self, state: InvocationState) -> ToolInvocation {
        ToolInvocation {
            call_id: self.id,
            tool_name: self.name,
            args: self.arguments,
            state,
        }
    }
}

/// The core Tool trait.
///
/// Each retrieval capability implements this trait. Tools are registered in
/// the ToolRegistry and made available to the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "search_web").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    ///
    /// Implementations must return promptly once `cancel` fires.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up and execute tools when the LLM requests them
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool call.
    pub async fn execute(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.execute(call.arguments.clone(), cancel).await
    }

    /// Execute a tool call and fold the outcome into an invocation state.
    /// Tool failures become `Error` states instead of propagating.
    pub async fn invoke(&self, call: &ToolCall, cancel: &CancellationToken) -> InvocationState {
        match self.execute(call, cancel).await {
            Ok(result) => InvocationState::Result { result },
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                InvocationState::Error { error: e.to_string() }
            }
        }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
