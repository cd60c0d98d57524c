//! Turn-level streaming events.
//!
//! `TurnEvent` is what a client sees while a turn runs. The gateway frames
//! each one as an SSE event named by [`TurnEvent::event_type`] with the JSON
//! serialization as its data.

use deepsearch_core::message::{InvocationState, ToolInvocation};
use deepsearch_core::tool::ToolCall;
use serde::{Deserialize, Serialize};

/// Events emitted on a turn's output channel, in publication order:
/// - `control`: out-of-band signalling (new conversation, step limit)
/// - `text-delta`: partial assistant text
/// - `tool-call`: a tool invocation became visible, outcome unknown
/// - `tool-result`: outcome of a previously announced invocation
/// - `error`: the turn failed; generic message only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    Control(ControlEvent),

    TextDelta { text: String },

    ToolCall {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },

    ToolResult {
        call_id: String,
        tool_name: String,
        state: InvocationState,
    },

    Error { message: String },
}

/// Side-channel signals that do not represent model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlEvent {
    /// This turn created the conversation; carries its id.
    NewConversation { conversation_id: String },
    /// The loop stopped at the step cap while the model still wanted tools.
    StepLimitReached { steps: u32 },
}

impl TurnEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Control(_) => "control",
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
        }
    }

    pub fn tool_call(call: &ToolCall) -> Self {
        Self::ToolCall {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        }
    }

    pub fn tool_result(invocation: &ToolInvocation) -> Self {
        Self::ToolResult {
            call_id: invocation.call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            state: invocation.state.clone(),
        }
    }
}
