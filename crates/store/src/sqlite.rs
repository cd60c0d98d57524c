//! SQLite conversation store.
//!
//! Two tables:
//! - `conversations`: one row per chat, carrying its owner and title
//! - `messages`: the ordered history, keyed by (conversation, position)
//!
//! `upsert` rewrites a conversation's whole history inside one immediate
//! transaction, so readers only ever observe the previous or the new history
//! and concurrent writers queue on the busy timeout instead of failing.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deepsearch_core::error::StoreError;
use deepsearch_core::message::{Conversation, ConversationId, ConversationSummary, Message, MessagePart, Role};
use deepsearch_core::store::{ConversationStore, UpsertOutcome};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// A SQLite-backed conversation store.
pub struct SqliteConversationStore {
    pool: SqlitePool,
    #[cfg(test)]
    fail_after_delete: std::sync::atomic::AtomicBool,
}

impl SqliteConversationStore {
    /// Open (or create) the database at `url`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .pragma("foreign_keys", "ON");

        // An in-memory database lives and dies with its connection, so pin one.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite conversation store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            #[cfg(test)]
            fail_after_delete: std::sync::atomic::AtomicBool::new(false),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id          TEXT PRIMARY KEY NOT NULL,
                owner_id    TEXT NOT NULL,
                title       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                write_seq   INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                position        INTEGER NOT NULL,
                id              TEXT NOT NULL,
                role            TEXT NOT NULL,
                content         TEXT NOT NULL,
                parts           TEXT NOT NULL DEFAULT '[]',
                created_at      TEXT NOT NULL,
                PRIMARY KEY (conversation_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_owner_updated ON conversations(owner_id, updated_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("owner index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Make the next upsert fail between deleting and re-inserting messages.
    #[cfg(test)]
    pub(crate) fn inject_failure_after_delete(&self) {
        self.fail_after_delete
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_fault(&self) -> Result<(), StoreError> {
        if self
            .fail_after_delete
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::Storage("injected failure after delete".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_fault(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn parse_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    /// Parse a `Message` from a SQLite row.
    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
        let col = |name: &str, e: sqlx::Error| StoreError::QueryFailed(format!("{name} column: {e}"));

        let position: i64 = row.try_get("position").map_err(|e| col("position", e))?;
        let id: String = row.try_get("id").map_err(|e| col("id", e))?;
        let role_str: String = row.try_get("role").map_err(|e| col("role", e))?;
        let content: String = row.try_get("content").map_err(|e| col("content", e))?;
        let parts_json: String = row.try_get("parts").map_err(|e| col("parts", e))?;
        let created_at: String = row.try_get("created_at").map_err(|e| col("created_at", e))?;

        let role = Role::parse(&role_str)
            .ok_or_else(|| StoreError::QueryFailed(format!("unknown role '{role_str}'")))?;
        let parts: Vec<MessagePart> = serde_json::from_str(&parts_json)
            .map_err(|e| StoreError::QueryFailed(format!("parts of message {id}: {e}")))?;

        Ok(Message {
            id,
            role,
            content,
            parts,
            ordinal: position as u32,
            created_at: Self::parse_time(&created_at),
        })
    }

    fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationSummary, StoreError> {
        let col = |name: &str, e: sqlx::Error| StoreError::QueryFailed(format!("{name} column: {e}"));
        let id: String = row.try_get("id").map_err(|e| col("id", e))?;
        let title: String = row.try_get("title").map_err(|e| col("title", e))?;
        let created_at: String = row.try_get("created_at").map_err(|e| col("created_at", e))?;
        let updated_at: String = row.try_get("updated_at").map_err(|e| col("updated_at", e))?;
        Ok(ConversationSummary {
            id: ConversationId(id),
            title,
            created_at: Self::parse_time(&created_at),
            updated_at: Self::parse_time(&updated_at),
        })
    }
}

/// Fixed-width UTC timestamps so TEXT ordering matches time ordering.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(
        &self,
        owner_id: &str,
        conversation_id: &ConversationId,
        title: &str,
        messages: &[Message],
    ) -> Result<UpsertOutcome, StoreError> {
        let now = timestamp(Utc::now());
        // IMMEDIATE takes the write lock up front. A deferred transaction
        // that reads first fails with SQLITE_BUSY when it tries to upgrade
        // while another connection is writing.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let existing_owner: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM conversations WHERE id = ?1")
                .bind(conversation_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("owner lookup: {e}")))?;

        // Returning early drops `tx`, which rolls back.
        let outcome = match existing_owner {
            Some(owner) if owner != owner_id => {
                return Err(StoreError::OwnershipViolation {
                    conversation_id: conversation_id.to_string(),
                });
            }
            Some(_) => {
                sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
                    .bind(conversation_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Storage(format!("DELETE failed: {e}")))?;
                UpsertOutcome::Updated
            }
            None => {
                sqlx::query(
                    "INSERT INTO conversations (id, owner_id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                )
                .bind(conversation_id.as_str())
                .bind(owner_id)
                .bind(title)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(format!("INSERT conversation failed: {e}")))?;
                UpsertOutcome::Created
            }
        };

        self.check_fault()?;

        for (position, message) in messages.iter().enumerate() {
            let parts_json = serde_json::to_string(&message.parts)
                .map_err(|e| StoreError::Storage(format!("Parts serialization: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, position, id, role, content, parts, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(conversation_id.as_str())
            .bind(position as i64)
            .bind(&message.id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&parts_json)
            .bind(timestamp(message.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("INSERT message failed: {e}")))?;
        }

        sqlx::query(
            r#"
            UPDATE conversations
            SET title = ?1, updated_at = ?2,
                write_seq = (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM conversations)
            WHERE id = ?3
            "#,
        )
        .bind(title)
        .bind(&now)
        .bind(conversation_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE conversation failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        debug!(
            conversation_id = %conversation_id,
            messages = messages.len(),
            ?outcome,
            "Upserted conversation"
        );
        Ok(outcome)
    }

    async fn get(
        &self,
        owner_id: &str,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        // Read header and messages from one snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let header = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1 AND owner_id = ?2",
        )
        .bind(conversation_id.as_str())
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("conversation lookup: {e}")))?;

        let Some(header) = header else {
            return Ok(None);
        };
        let summary = Self::row_to_summary(&header)?;

        let rows = sqlx::query(
            "SELECT position, id, role, content, parts, created_at FROM messages WHERE conversation_id = ?1 ORDER BY position ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("messages lookup: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        let messages = rows.iter().map(Self::row_to_message).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Conversation {
            id: summary.id,
            owner_id: owner_id.to_string(),
            title: summary.title,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
            messages,
        }))
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE owner_id = ?1 ORDER BY updated_at DESC, write_seq DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list conversations: {e}")))?;

        rows.iter().map(Self::row_to_summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    async fn test_store() -> SqliteConversationStore {
        SqliteConversationStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn creates_then_replaces_history() {
        conformance::creates_then_replaces_history(&test_store().await).await;
    }

    #[tokio::test]
    async fn ownership_is_enforced_on_write() {
        conformance::ownership_is_enforced_on_write(&test_store().await).await;
    }

    #[tokio::test]
    async fn foreign_conversations_are_invisible() {
        conformance::foreign_conversations_are_invisible(&test_store().await).await;
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        conformance::upsert_is_idempotent(&test_store().await).await;
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_update() {
        conformance::list_orders_by_most_recent_update(&test_store().await).await;
    }

    #[tokio::test]
    async fn parts_survive_storage() {
        conformance::parts_survive_storage(&test_store().await).await;
    }

    #[tokio::test]
    async fn failure_after_delete_rolls_back() {
        let store = test_store().await;
        let id = ConversationId::from("chat-atomic");
        let before = vec![Message::user("first"), Message::assistant("reply")];
        store.upsert("alice", &id, "first", &before).await.unwrap();

        store.inject_failure_after_delete();
        let after = vec![Message::user("replacement")];
        let err = store.upsert("alice", &id, "replacement", &after).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));

        let conv = store.get("alice", &id).await.unwrap().unwrap();
        assert_eq!(conv.title, "first");
        let texts: Vec<String> = conv.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["first", "reply"]);
    }

    #[tokio::test]
    async fn failure_on_create_leaves_no_conversation() {
        let store = test_store().await;
        let id = ConversationId::from("chat-new");
        store.inject_failure_after_delete();
        assert!(store.upsert("alice", &id, "t", &[Message::user("hi")]).await.is_err());
        assert!(store.get("alice", &id).await.unwrap().is_none());
        assert!(store.list("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn equal_timestamps_list_latest_write_first() {
        let store = test_store().await;
        let a = ConversationId::from("chat-a");
        let b = ConversationId::from("chat-b");
        store.upsert("alice", &a, "a", &[Message::user("a")]).await.unwrap();
        store.upsert("alice", &b, "b", &[Message::user("b")]).await.unwrap();
        store.upsert("alice", &a, "a again", &[Message::user("a")]).await.unwrap();

        sqlx::query("UPDATE conversations SET updated_at = '2026-01-01T00:00:00.000000Z'")
            .execute(&store.pool)
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["chat-a", "chat-b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_on_file_database_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("busy.db").display());
        let store = std::sync::Arc::new(SqliteConversationStore::new(&url).await.unwrap());

        let mut handles = Vec::new();
        for chat in 0..16 {
            for round in 0..10 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    let id = ConversationId::from(format!("chat-{chat}").as_str());
                    let history = vec![Message::user(format!("q{round}")), Message::assistant("a")];
                    store.upsert("alice", &id, "busy", &history).await
                }));
            }
        }

        let mut failures = Vec::new();
        for handle in handles {
            if let Err(e) = handle.await.unwrap() {
                failures.push(e.to_string());
            }
        }
        assert!(failures.is_empty(), "{} upserts failed, e.g. {:?}", failures.len(), failures.first());
        assert_eq!(store.list("alice").await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("chats.db").display());
        let id = ConversationId::from("chat-file");
        {
            let store = SqliteConversationStore::new(&url).await.unwrap();
            store.upsert("alice", &id, "saved", &[Message::user("persist me")]).await.unwrap();
        }
        let store = SqliteConversationStore::new(&url).await.unwrap();
        let conv = store.get("alice", &id).await.unwrap().unwrap();
        assert_eq!(conv.messages[0].text(), "persist me");
    }
}
