//! ConversationStore trait: transactional persistence of chat histories.
//!
//! A conversation's history is only ever replaced as a whole. Every read and
//! write is scoped to an owner: a conversation owned by someone else is
//! invisible to reads and rejected on writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::{Conversation, ConversationId, ConversationSummary, Message};

/// Whether an upsert created the conversation or replaced an existing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// The conversation store trait.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Atomically replace the conversation's history with `messages`, in
    /// order, and set its title and update timestamp. Creates the
    /// conversation for `owner_id` if it does not exist.
    ///
    /// Fails with [`StoreError::OwnershipViolation`] without writing anything
    /// when the conversation belongs to another owner.
    async fn upsert(
        &self,
        owner_id: &str,
        conversation_id: &ConversationId,
        title: &str,
        messages: &[Message],
    ) -> std::result::Result<UpsertOutcome, StoreError>;

    /// Load a conversation with messages ordered by ordinal. Returns `None`
    /// both when it does not exist and when another owner holds it.
    async fn get(
        &self,
        owner_id: &str,
        conversation_id: &ConversationId,
    ) -> std::result::Result<Option<Conversation>, StoreError>;

    /// All of the owner's conversations, most recently updated first.
    async fn list(&self, owner_id: &str) -> std::result::Result<Vec<ConversationSummary>, StoreError>;
}
