//! Message and Conversation domain types.
//!
//! These are the core value objects that flow through the entire system:
//! client submits messages → store persists them → agent loop appends steps →
//! store replaces the history with the merged result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Title used when no message carries any text.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// Tool output submitted as its own message
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One structured piece of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Plain text.
    Text { text: String },
    /// A tool call requested by the model, together with its outcome.
    ToolInvocation(ToolInvocation),
}

/// A model-requested tool call and, once known, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Correlates the request with exactly one outcome.
    pub call_id: String,

    pub tool_name: String,

    /// Input arguments as produced by the model
    #[serde(default)]
    pub args: serde_json::Value,

    pub state: InvocationState,
}

/// Lifecycle of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InvocationState {
    Pending,
    Result { result: serde_json::Value },
    Error { error: String },
}

impl InvocationState {
    pub fn is_pending(&self) -> bool {
        matches!(self, InvocationState::Pending)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    #[serde(default = "new_message_id")]
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Raw content; may be empty when everything lives in `parts`
    #[serde(default)]
    pub content: String,

    /// Structured parts in display order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,

    /// Zero-based position within the conversation
    #[serde(default)]
    pub ordinal: u32,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    fn with_role(role: Role, content: String, parts: Vec<MessagePart>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content,
            parts,
            ordinal: 0,
            created_at: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        let parts = vec![MessagePart::Text { text: content.clone() }];
        Self::with_role(Role::User, content, parts)
    }

    /// Create a plain-text assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::assistant_step(content, Vec::new())
    }

    /// Create the assistant message for one loop step: its text (if any)
    /// followed by the step's tool invocations in request order.
    pub fn assistant_step(text: impl Into<String>, invocations: Vec<ToolInvocation>) -> Self {
        let text = text.into();
        let mut parts = Vec::with_capacity(invocations.len() + 1);
        if !text.is_empty() {
            parts.push(MessagePart::Text { text: text.clone() });
        }
        parts.extend(invocations.into_iter().map(MessagePart::ToolInvocation));
        Self::with_role(Role::Assistant, text, parts)
    }

    /// The message's visible text: its text parts joined, or the raw content
    /// when it has none.
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::ToolInvocation(_) => None,
            })
            .collect();
        if texts.is_empty() {
            self.content.clone()
        } else {
            texts.join("")
        }
    }

    /// Tool invocations in part order.
    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            MessagePart::ToolInvocation(inv) => Some(inv),
            MessagePart::Text { .. } => None,
        })
    }

    /// Returns the first call id that appears more than once in this message.
    pub fn duplicate_call_id(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.tool_invocations()
            .map(|inv| inv.call_id.as_str())
            .find(|id| !seen.insert(*id))
    }
}

/// Rewrite ordinals so they are dense, zero-based and follow slice order.
pub fn assign_ordinals(messages: &mut [Message]) {
    for (i, msg) in messages.iter_mut().enumerate() {
        msg.ordinal = i as u32;
    }
}

/// Derive a display title from the most recent message, truncated to
/// `max_chars` characters. Returns `None` when that message has no text.
pub fn derive_title(messages: &[Message], max_chars: usize) -> Option<String> {
    let text = messages.last()?.text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_chars).collect())
}

/// A conversation is an ordered sequence of messages owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// The single user allowed to read or write this conversation
    pub owner_id: String,

    pub title: String,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the history was last replaced
    pub updated_at: DateTime<Utc>,

    /// Messages ordered by ordinal
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A conversation without its message bodies, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
