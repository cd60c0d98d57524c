//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`: Submit a turn, receive an SSE stream
//! - `GET  /v1/conversations`: List the caller's conversations
//! - `GET  /v1/conversations/{id}`: Get one conversation with its messages

use axum::{
    Extension, Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use deepsearch_agent::{TurnError, TurnRequest, TurnService};
use deepsearch_core::error::StoreError;
use deepsearch_core::message::{Conversation, ConversationId, ConversationSummary, Message};

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub turns: Arc<TurnService>,
    /// Bearer token → user id. Empty means a single local user.
    pub users: HashMap<String, String>,
}

pub type SharedApiState = Arc<ApiV1State>;

/// User id assigned when no bearer tokens are configured.
pub const LOCAL_USER: &str = "local";

/// The authenticated caller, inserted by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// Build the v1 router (without auth; the caller layers it on).
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/conversations", get(list_conversations_handler))
        .route("/conversations/{id}", get(get_conversation_handler))
        .with_state(state)
}

// ── Request/Response types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default, alias = "conversation_id", alias = "id")]
    conversation_id: Option<String>,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<ConversationSummary>,
}

#[derive(Serialize)]
struct ConversationDetailResponse {
    id: String,
    title: String,
    created_at: String,
    updated_at: String,
    messages: Vec<Message>,
}

impl From<Conversation> for ConversationDetailResponse {
    fn from(conv: Conversation) -> Self {
        Self {
            id: conv.id.0,
            title: conv.title,
            created_at: conv.created_at.to_rfc3339(),
            updated_at: conv.updated_at.to_rfc3339(),
            messages: conv.messages,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn chat_not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Chat not found")
}

fn store_failure(err: StoreError) -> ApiError {
    error!(error = %err, "Conversation store failure");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
}

fn turn_error(err: TurnError) -> ApiError {
    match err {
        TurnError::InvalidRequest(reason) => api_error(StatusCode::BAD_REQUEST, reason),
        TurnError::Store(StoreError::OwnershipViolation { conversation_id }) => {
            warn!(conversation_id = %conversation_id, "Turn rejected for foreign conversation");
            chat_not_found()
        }
        TurnError::Store(e) => store_failure(e),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/chat`: Persist the submitted history, then stream the turn.
///
/// Errors before the turn starts come back as plain JSON responses. After
/// that everything (including failures) travels over the stream, which
/// closes once the final history has been written. Dropping the stream
/// cancels the turn.
async fn chat_handler(
    State(state): State<SharedApiState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    info!(
        user_id = %user_id,
        messages = payload.messages.len(),
        "v1/chat request"
    );

    let request = TurnRequest {
        conversation_id: payload.conversation_id.as_deref().map(ConversationId::from),
        messages: payload.messages,
    };
    let handle = state.turns.start(&user_id, request).await.map_err(turn_error)?;
    info!(
        conversation_id = %handle.conversation_id,
        created = handle.created,
        "Turn started"
    );

    let (rx, _task) = handle.into_parts();
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_conversations_handler(
    State(state): State<SharedApiState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let conversations = state.turns.store().list(&user_id).await.map_err(store_failure)?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn get_conversation_handler(
    State(state): State<SharedApiState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetailResponse>, ApiError> {
    let conv = state
        .turns
        .store()
        .get(&user_id, &ConversationId::from(&id))
        .await
        .map_err(store_failure)?
        .ok_or_else(chat_not_found)?;
    Ok(Json(conv.into()))
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use deepsearch_agent::AgentLoop;
    use deepsearch_agent::test_helpers::{ScriptStep, ScriptedProvider, StubTool, call};
    use deepsearch_core::store::ConversationStore;
    use deepsearch_core::tool::ToolRegistry;
    use deepsearch_store::InMemoryConversationStore;
    use serde_json::{Value, json};

    fn test_api_state(script: Vec<ScriptStep>) -> (SharedApiState, Arc<InMemoryConversationStore>) {
        let store = Arc::new(InMemoryConversationStore::new());
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(StubTool::new("search_web", json!([{"title": "Rust"}]))));
        let agent = AgentLoop::new(
            Arc::new(ScriptedProvider::new(script)),
            "mock-model",
            0.0,
            Arc::new(tools),
        );
        let turns = TurnService::new(Arc::new(agent), store.clone());
        let state = Arc::new(ApiV1State {
            turns: Arc::new(turns),
            users: HashMap::new(),
        });
        (state, store)
    }

    fn app(state: SharedApiState, user: &str) -> Router {
        v1_router(state).layer(Extension(AuthUser(user.to_string())))
    }

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn chat_streams_control_before_text() {
        let (state, _) = test_api_state(vec![ScriptStep::text(&["Hello", " there"])]);

        let response = app(state, "alice")
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let control = body.find("event: control").expect("control event");
        let text = body.find("event: text-delta").expect("text event");
        assert!(control < text);
        assert!(body.contains("new-conversation"));
        assert!(body.contains(" there"));
    }

    #[tokio::test]
    async fn chat_streams_tool_events() {
        let (state, store) = test_api_state(vec![
            ScriptStep::calls(&[], vec![call("c1", "search_web", json!({"query": "rust"}))]),
            ScriptStep::text(&["Found it"]),
        ]);

        let response = app(state, "alice")
            .oneshot(chat_request(json!({
                "conversationId": "chat-1",
                "messages": [{"role": "user", "content": "search rust"}]
            })))
            .await
            .unwrap();
        let body = body_string(response).await;

        let tool_call = body.find("event: tool-call").expect("tool-call event");
        let tool_result = body.find("event: tool-result").expect("tool-result event");
        assert!(tool_call < tool_result);

        let stored = store
            .get("alice", &ConversationId::from("chat-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 3);
        assert_eq!(stored.title, "Found it");
    }

    #[tokio::test]
    async fn existing_conversation_gets_no_control_event() {
        let (state, store) = test_api_state(vec![ScriptStep::text(&["Again"])]);
        store
            .upsert("alice", &ConversationId::from("chat-1"), "Old", &[Message::user("hi")])
            .await
            .unwrap();

        let response = app(state, "alice")
            .oneshot(chat_request(json!({
                "conversation_id": "chat-1",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .await
            .unwrap();
        let body = body_string(response).await;
        assert!(!body.contains("event: control"));
        assert!(body.contains("Again"));
    }

    #[tokio::test]
    async fn chat_with_empty_messages_is_rejected() {
        let (state, store) = test_api_state(vec![]);

        let response = app(state, "alice")
            .oneshot(chat_request(json!({"messages": []})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn chat_on_foreign_conversation_is_not_found() {
        let (state, store) = test_api_state(vec![ScriptStep::text(&["nope"])]);
        store
            .upsert("bob", &ConversationId::from("bobs"), "Bob's", &[Message::user("secret")])
            .await
            .unwrap();

        let response = app(state, "alice")
            .oneshot(chat_request(json!({
                "conversationId": "bobs",
                "messages": [{"role": "user", "content": "let me in"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "Chat not found");

        let bobs = store.get("bob", &ConversationId::from("bobs")).await.unwrap().unwrap();
        assert_eq!(bobs.messages.len(), 1);
        assert_eq!(bobs.title, "Bob's");
    }

    #[tokio::test]
    async fn list_and_get_after_chat() {
        let (state, _) = test_api_state(vec![ScriptStep::text(&["Answer"])]);

        let response = app(state.clone(), "alice")
            .oneshot(chat_request(json!({
                "conversationId": "chat-9",
                "messages": [{"role": "user", "content": "Question"}]
            })))
            .await
            .unwrap();
        body_string(response).await;

        let req = Request::builder()
            .uri("/conversations")
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone(), "alice").oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["conversations"][0]["id"], "chat-9");
        assert!(body["conversations"][0].get("messages").is_none());

        let req = Request::builder()
            .uri("/conversations/chat-9")
            .body(Body::empty())
            .unwrap();
        let response = app(state, "alice").oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["messages"][0]["ordinal"], 0);
        assert_eq!(body["messages"][1]["ordinal"], 1);
        assert_eq!(body["messages"][1]["role"], "assistant");
    }

    #[tokio::test]
    async fn get_conversation_of_another_user_is_not_found() {
        let (state, store) = test_api_state(vec![]);
        store
            .upsert("bob", &ConversationId::from("bobs"), "Bob's", &[Message::user("secret")])
            .await
            .unwrap();

        let req = Request::builder()
            .uri("/conversations/bobs")
            .body(Body::empty())
            .unwrap();
        let response = app(state, "alice").oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_is_empty_for_new_user() {
        let (state, _) = test_api_state(vec![]);
        let req = Request::builder()
            .uri("/conversations")
            .body(Body::empty())
            .unwrap();
        let response = app(state, "carol").oneshot(req).await.unwrap();
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["conversations"], json!([]));
    }
}
