//! End-to-end turn tests.
//!
//! These run the full pipeline: SQLite conversation store, the real
//! `search_web` / `scrape_pages` tools over stub backends, the agent loop
//! driven by a scripted model, and the stream publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use deepsearch_agent::test_helpers::{ScriptStep, ScriptedProvider, call};
use deepsearch_agent::{AgentLoop, ControlEvent, TurnEvent, TurnFinish, TurnRequest, TurnService};
use deepsearch_config::AppConfig;
use deepsearch_core::error::RetrievalError;
use deepsearch_core::message::{ConversationId, InvocationState, Message, MessagePart, Role};
use deepsearch_core::store::ConversationStore;
use deepsearch_store::SqliteConversationStore;
use deepsearch_tools::{PageFetcher, SearchBackend, SearchResult, registry_with};

// ── Stub backends ────────────────────────────────────────────────────────

struct StubSearch;

#[async_trait]
impl SearchBackend for StubSearch {
    async fn search(
        &self,
        query: &str,
        num_results: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, RetrievalError> {
        Ok((0..num_results.min(2))
            .map(|i| SearchResult {
                title: format!("{query} #{i}"),
                link: format!("https://example.com/{i}"),
                snippet: format!("About {query}"),
                date: None,
            })
            .collect())
    }
}

/// Serves pages from a map; anything else fails. Optionally hangs until
/// cancelled.
#[derive(Default)]
struct StubFetcher {
    pages: HashMap<String, String>,
    hang: bool,
    attempts: Mutex<HashMap<String, u32>>,
}

impl StubFetcher {
    fn with_pages(pages: &[(&str, &str)]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    fn attempts(&self, url: &str) -> u32 {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String, RetrievalError> {
        *self.attempts.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if self.hang {
            cancel.cancelled().await;
            return Err(RetrievalError::Cancelled);
        }
        self.pages.get(url).cloned().ok_or_else(|| RetrievalError::Http {
            status: 404,
            message: "Not Found".into(),
        })
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.crawl.retry_delay_ms = 0;
    config.crawl.max_attempts = 3;
    config
}

async fn service(
    provider: ScriptedProvider,
    fetcher: Arc<StubFetcher>,
) -> (TurnService, Arc<SqliteConversationStore>) {
    let config = test_config();
    let store = Arc::new(SqliteConversationStore::new("sqlite::memory:").await.unwrap());
    let tools = Arc::new(registry_with(Arc::new(StubSearch), fetcher, &config));
    let agent = AgentLoop::new(Arc::new(provider), "scripted-model", 0.0, tools);
    (TurnService::new(Arc::new(agent), store.clone()), store)
}

async fn drain(mut events: tokio::sync::mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    seen
}

fn invocation(message: &Message) -> &deepsearch_core::message::ToolInvocation {
    message
        .parts
        .iter()
        .find_map(|p| match p {
            MessagePart::ToolInvocation(inv) => Some(inv),
            MessagePart::Text { .. } => None,
        })
        .expect("message has a tool invocation")
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn search_then_scrape_then_answer() {
    let fetcher = Arc::new(StubFetcher::with_pages(&[(
        "https://example.com/0",
        "Rust 1.88 shipped let chains.",
    )]));
    let provider = ScriptedProvider::new(vec![
        ScriptStep::calls(&["Searching. "], vec![call("s1", "search_web", json!({"query": "rust news"}))]),
        ScriptStep::calls(
            &[],
            vec![call(
                "p1",
                "scrape_pages",
                json!({"urls": ["https://example.com/0", "https://example.com/1"]}),
            )],
        ),
        ScriptStep::text(&["Rust 1.88 ", "added let chains."]),
    ]);
    let requests = provider.requests();
    let (turns, store) = service(provider, fetcher.clone()).await;

    let handle = turns
        .start(
            "alice",
            TurnRequest {
                conversation_id: None,
                messages: vec![Message::user("What is new in Rust?")],
            },
        )
        .await
        .unwrap();
    assert!(handle.created);
    let id = handle.conversation_id.clone();
    let (events, task) = handle.into_parts();
    let events = drain(events).await;
    let summary = task.await.unwrap();

    assert!(matches!(summary.finish, TurnFinish::Done(_)));
    assert!(summary.persisted);
    assert_eq!(summary.steps, 3);

    // Control first, then events in step order.
    assert_eq!(
        events[0],
        TurnEvent::Control(ControlEvent::NewConversation {
            conversation_id: id.to_string()
        })
    );
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(
        kinds,
        vec![
            "control",
            "text-delta",
            "tool-call",
            "tool-result",
            "tool-call",
            "tool-result",
            "text-delta",
            "text-delta",
        ]
    );

    // The broken URL was retried to the limit; the good one fetched once.
    assert_eq!(fetcher.attempts("https://example.com/0"), 1);
    assert_eq!(fetcher.attempts("https://example.com/1"), 3);

    // The model saw the tool results on its next step.
    assert_eq!(requests.lock().len(), 3);

    let stored = store.get("alice", &id).await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 4);
    assert_eq!(stored.title, "Rust 1.88 added let chains.");
    for (i, message) in stored.messages.iter().enumerate() {
        assert_eq!(message.ordinal as usize, i);
    }
    assert_eq!(stored.messages[0].role, Role::User);
    assert_eq!(stored.messages[3].text(), "Rust 1.88 added let chains.");

    let search = invocation(&stored.messages[1]);
    assert_eq!(search.tool_name, "search_web");
    let InvocationState::Result { result } = &search.state else {
        panic!("search should succeed");
    };
    assert_eq!(result[0]["link"], "https://example.com/0");

    // Partial crawl failure is a successful invocation carrying per-URL detail.
    let scrape = invocation(&stored.messages[2]);
    let InvocationState::Result { result } = &scrape.state else {
        panic!("partial crawl is still a result");
    };
    let partial = result["partialResults"].as_array().unwrap();
    assert_eq!(partial.len(), 2);
    assert_eq!(partial[0]["success"], true);
    assert_eq!(partial[0]["content"], "Rust 1.88 shipped let chains.");
    assert_eq!(partial[1]["success"], false);
    assert!(result["error"].as_str().unwrap().contains("example.com/1"));
}

#[tokio::test]
async fn second_turn_continues_the_same_conversation() {
    let fetcher = Arc::new(StubFetcher::default());
    let provider = ScriptedProvider::new(vec![ScriptStep::text(&["First answer"]), ScriptStep::text(&["Second answer"])]);
    let (turns, store) = service(provider, fetcher).await;
    let id = ConversationId::from("chat-1");

    let first = turns
        .start(
            "alice",
            TurnRequest {
                conversation_id: Some(id.clone()),
                messages: vec![Message::user("one")],
            },
        )
        .await
        .unwrap();
    assert!(first.created);
    let (events, task) = first.into_parts();
    drain(events).await;
    task.await.unwrap();

    let mut history = store.get("alice", &id).await.unwrap().unwrap().messages;
    history.push(Message::user("two"));
    let second = turns
        .start(
            "alice",
            TurnRequest {
                conversation_id: Some(id.clone()),
                messages: history,
            },
        )
        .await
        .unwrap();
    assert!(!second.created);
    let (events, task) = second.into_parts();
    let events = drain(events).await;
    task.await.unwrap();

    assert!(events.iter().all(|e| !matches!(e, TurnEvent::Control(_))));

    let stored = store.get("alice", &id).await.unwrap().unwrap();
    let texts: Vec<String> = stored.messages.iter().map(Message::text).collect();
    assert_eq!(texts, vec!["one", "First answer", "two", "Second answer"]);
    let ordinals: Vec<u32> = stored.messages.iter().map(|m| m.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2, 3]);
    assert_eq!(store.list("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn endless_tool_requests_stop_at_step_cap() {
    let fetcher = Arc::new(StubFetcher::default());
    let provider = ScriptedProvider::always_calling("search_web", json!({"query": "again"}));
    let (turns, store) = service(provider, fetcher).await;

    let handle = turns
        .start(
            "alice",
            TurnRequest {
                conversation_id: None,
                messages: vec![Message::user("loop forever")],
            },
        )
        .await
        .unwrap();
    let id = handle.conversation_id.clone();
    let (events, task) = handle.into_parts();
    let events = drain(events).await;
    let summary = task.await.unwrap();

    assert_eq!(summary.steps, 10);
    assert_eq!(
        events.last(),
        Some(&TurnEvent::Control(ControlEvent::StepLimitReached { steps: 10 }))
    );
    assert_eq!(events.iter().filter(|e| e.event_type() == "tool-call").count(), 10);

    let stored = store.get("alice", &id).await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 11);
    // No text was produced, so the title stays the one from the user message.
    assert_eq!(stored.title, "loop forever");
}

#[tokio::test]
async fn cancelling_mid_crawl_keeps_only_the_submitted_history() {
    let fetcher = Arc::new(StubFetcher::hanging());
    let provider = ScriptedProvider::new(vec![ScriptStep::calls(
        &["Reading pages"],
        vec![call("p1", "scrape_pages", json!({"urls": ["https://slow.example"]}))],
    )]);
    let (turns, store) = service(provider, fetcher.clone()).await;

    let handle = turns
        .start(
            "alice",
            TurnRequest {
                conversation_id: Some(ConversationId::from("slow")),
                messages: vec![Message::user("read the slow page")],
            },
        )
        .await
        .unwrap();
    let cancel = handle.cancellation_token();
    let (mut events, task) = handle.into_parts();

    // Wait until the crawl is underway, then cancel.
    while let Some(event) = events.recv().await {
        if event.event_type() == "tool-call" {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let rest = drain(events).await;
    assert!(rest.iter().all(|e| e.event_type() != "tool-result"));
    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("turn stops promptly")
        .unwrap();
    assert!(matches!(summary.finish, TurnFinish::Cancelled));
    assert!(!summary.persisted);
    assert_eq!(fetcher.attempts("https://slow.example"), 1);

    let stored = store.get("alice", &ConversationId::from("slow")).await.unwrap().unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].text(), "read the slow page");
}

#[tokio::test]
async fn foreign_conversation_is_refused_before_streaming() {
    let fetcher = Arc::new(StubFetcher::default());
    let provider = ScriptedProvider::new(vec![ScriptStep::text(&["never"])]);
    let (turns, store) = service(provider, fetcher).await;
    store
        .upsert("bob", &ConversationId::from("bobs"), "Bob's", &[Message::user("private")])
        .await
        .unwrap();

    let result = turns
        .start(
            "alice",
            TurnRequest {
                conversation_id: Some(ConversationId::from("bobs")),
                messages: vec![Message::user("mine now")],
            },
        )
        .await;
    assert!(result.is_err());

    let bobs = store.get("bob", &ConversationId::from("bobs")).await.unwrap().unwrap();
    assert_eq!(bobs.messages.len(), 1);
    assert!(store.list("alice").await.unwrap().is_empty());
}
