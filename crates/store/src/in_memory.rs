//! In-memory conversation store: useful for testing and ephemeral sessions.
//!
//! Each upsert builds the complete new record before swapping it in under the
//! write lock, so a failed write never leaves a half-replaced history behind.

use async_trait::async_trait;
use chrono::Utc;
use deepsearch_core::error::StoreError;
use deepsearch_core::message::{Conversation, ConversationId, ConversationSummary, Message, assign_ordinals};
use deepsearch_core::store::{ConversationStore, UpsertOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Record {
    conversation: Conversation,
    /// Write sequence number; breaks ties between equal timestamps.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Record>,
    next_seq: u64,
}

/// A conversation store held entirely in process memory.
pub struct InMemoryConversationStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Number of stored conversations across all owners.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(
        &self,
        owner_id: &str,
        conversation_id: &ConversationId,
        title: &str,
        messages: &[Message],
    ) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let (created_at, outcome) = match inner.records.get(conversation_id.as_str()) {
            Some(existing) if existing.conversation.owner_id != owner_id => {
                return Err(StoreError::OwnershipViolation {
                    conversation_id: conversation_id.to_string(),
                });
            }
            Some(existing) => (existing.conversation.created_at, UpsertOutcome::Updated),
            None => (now, UpsertOutcome::Created),
        };

        let mut history = messages.to_vec();
        assign_ordinals(&mut history);

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            conversation_id.as_str().to_string(),
            Record {
                conversation: Conversation {
                    id: conversation_id.clone(),
                    owner_id: owner_id.to_string(),
                    title: title.to_string(),
                    created_at,
                    updated_at: now,
                    messages: history,
                },
                seq,
            },
        );
        Ok(outcome)
    }

    async fn get(
        &self,
        owner_id: &str,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .get(conversation_id.as_str())
            .filter(|r| r.conversation.owner_id == owner_id)
            .map(|r| r.conversation.clone()))
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut owned: Vec<&Record> = inner
            .records
            .values()
            .filter(|r| r.conversation.owner_id == owner_id)
            .collect();
        owned.sort_by(|a, b| {
            b.conversation
                .updated_at
                .cmp(&a.conversation.updated_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(owned.into_iter().map(|r| r.conversation.summary()).collect())
    }
}
