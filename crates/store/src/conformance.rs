//! Behaviour every `ConversationStore` backend must share.

use deepsearch_core::error::StoreError;
use deepsearch_core::message::{ConversationId, InvocationState, Message, ToolInvocation};
use deepsearch_core::store::{ConversationStore, UpsertOutcome};
use serde_json::json;

fn texts(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.text()).collect()
}

pub async fn creates_then_replaces_history(store: &dyn ConversationStore) {
    let id = ConversationId::from("chat-1");
    let first = vec![Message::user("What is Rust?")];
    let outcome = store.upsert("alice", &id, "What is Rust?", &first).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Created);

    let mut second = first.clone();
    second.push(Message::assistant("A systems language."));
    second.push(Message::user("Who made it?"));
    let outcome = store.upsert("alice", &id, "Who made it?", &second).await.unwrap();
    assert_eq!(outcome, UpsertOutcome::Updated);

    let conv = store.get("alice", &id).await.unwrap().unwrap();
    assert_eq!(conv.title, "Who made it?");
    assert_eq!(conv.owner_id, "alice");
    assert_eq!(texts(&conv.messages), vec!["What is Rust?", "A systems language.", "Who made it?"]);
    let ordinals: Vec<u32> = conv.messages.iter().map(|m| m.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
}

pub async fn ownership_is_enforced_on_write(store: &dyn ConversationStore) {
    let id = ConversationId::from("chat-owned");
    store.upsert("alice", &id, "mine", &[Message::user("private")]).await.unwrap();

    let err = store
        .upsert("mallory", &id, "stolen", &[Message::user("overwrite")])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OwnershipViolation { .. }));

    let conv = store.get("alice", &id).await.unwrap().unwrap();
    assert_eq!(conv.title, "mine");
    assert_eq!(texts(&conv.messages), vec!["private"]);
}

pub async fn foreign_conversations_are_invisible(store: &dyn ConversationStore) {
    let id = ConversationId::from("chat-hidden");
    store.upsert("alice", &id, "hidden", &[Message::user("secret")]).await.unwrap();

    assert!(store.get("bob", &id).await.unwrap().is_none());
    assert!(store.list("bob").await.unwrap().is_empty());
    assert!(store.get("alice", &ConversationId::from("missing")).await.unwrap().is_none());
}

pub async fn upsert_is_idempotent(store: &dyn ConversationStore) {
    let id = ConversationId::from("chat-same");
    let history = vec![Message::user("one"), Message::assistant("two")];
    store.upsert("alice", &id, "one", &history).await.unwrap();
    store.upsert("alice", &id, "one", &history).await.unwrap();

    let conv = store.get("alice", &id).await.unwrap().unwrap();
    assert_eq!(conv.messages.len(), 2);
    assert_eq!(conv.messages[0].id, history[0].id);
    assert_eq!(store.list("alice").await.unwrap().len(), 1);
}

pub async fn list_orders_by_most_recent_update(store: &dyn ConversationStore) {
    let older = ConversationId::from("chat-older");
    let newer = ConversationId::from("chat-newer");
    store.upsert("alice", &older, "older", &[Message::user("a")]).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.upsert("alice", &newer, "newer", &[Message::user("b")]).await.unwrap();

    let ids: Vec<String> = store.list("alice").await.unwrap().into_iter().map(|s| s.id.0).collect();
    assert_eq!(ids, vec!["chat-newer", "chat-older"]);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store.upsert("alice", &older, "older", &[Message::user("a"), Message::user("c")]).await.unwrap();
    let ids: Vec<String> = store.list("alice").await.unwrap().into_iter().map(|s| s.id.0).collect();
    assert_eq!(ids, vec!["chat-older", "chat-newer"]);
}

pub async fn parts_survive_storage(store: &dyn ConversationStore) {
    let id = ConversationId::from("chat-parts");
    let step = Message::assistant_step(
        "Searching.",
        vec![
            ToolInvocation {
                call_id: "call-1".into(),
                tool_name: "search_web".into(),
                args: json!({"query": "rust"}),
                state: InvocationState::Result { result: json!([{"title": "Rust"}]) },
            },
            ToolInvocation {
                call_id: "call-2".into(),
                tool_name: "scrape_pages".into(),
                args: json!({"urls": ["https://x"]}),
                state: InvocationState::Error { error: "HTTP 503".into() },
            },
        ],
    );
    let history = vec![Message::user("find rust"), step.clone()];
    store.upsert("alice", &id, "Searching.", &history).await.unwrap();

    let conv = store.get("alice", &id).await.unwrap().unwrap();
    assert_eq!(conv.messages[1].parts, step.parts);
    let calls: Vec<&str> = conv.messages[1].tool_invocations().map(|i| i.call_id.as_str()).collect();
    assert_eq!(calls, vec!["call-1", "call-2"]);
}
