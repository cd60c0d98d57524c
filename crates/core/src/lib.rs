//! # deepsearch Core
//!
//! Domain types, traits, and error definitions for the deepsearch turn engine.
//! This crate has **zero framework dependencies**: it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of a turn is defined as a trait here: the model
//! ([`Provider`]), the retrieval tools ([`Tool`]) and persistence
//! ([`ConversationStore`]). Implementations live in their respective crates,
//! so the orchestrator can be driven end-to-end with stubs in tests.

pub mod error;
pub mod message;
pub mod provider;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, RetrievalError, StoreError, ToolError};
pub use message::{
    Conversation, ConversationId, ConversationSummary, InvocationState, Message, MessagePart,
    Role, ToolInvocation,
};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition};
pub use store::{ConversationStore, UpsertOutcome};
pub use tool::{Tool, ToolCall, ToolRegistry};
