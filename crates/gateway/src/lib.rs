//! HTTP API gateway for deepsearch.
//!
//! Exposes the health check and the v1 API: streaming chat turns plus the
//! conversation list and detail views.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use deepsearch_agent::TurnService;
use deepsearch_config::AppConfig;
use deepsearch_core::store::ConversationStore;

pub use api_v1::{ApiV1State, AuthUser, LOCAL_USER, SharedApiState};

/// Build the full router: `/health` plus the authenticated `/v1` API.
///
/// Layers applied:
/// - Bearer token authentication on all /v1 routes
/// - CORS restricted to the local origin
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedApiState) -> Router {
    let v1 = api_v1::v1_router(state.clone()).layer(middleware::from_fn_with_state(state, auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("http://localhost:8080"))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Open the configured conversation store.
///
/// SQLite file databases get their parent directory created first.
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn ConversationStore>, Box<dyn std::error::Error>> {
    let url = &config.store.database_url;
    if let Some(path) = url.strip_prefix("sqlite://").filter(|p| !p.starts_with(':'))
        && let Some(parent) = std::path::Path::new(path.split('?').next().unwrap_or(path)).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let store = deepsearch_store::SqliteConversationStore::new(url).await?;
    Ok(Arc::new(store))
}

/// Wire the turn service from configuration.
pub async fn build_turn_service(config: &AppConfig) -> Result<TurnService, Box<dyn std::error::Error>> {
    let endpoint = deepsearch_providers::resolve(config)?;
    let tools = Arc::new(deepsearch_tools::default_registry(config)?);
    let store = open_store(config).await?;
    info!(
        provider = %config.default_provider,
        model = %endpoint.model,
        store = store.name(),
        tools = ?tools.names(),
        "Turn service ready"
    );
    Ok(TurnService::from_config(config, endpoint.provider, &endpoint.model, tools, store))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let turns = build_turn_service(&config).await?;
    let users: HashMap<String, String> = config
        .gateway
        .users
        .iter()
        .map(|u| (u.token.clone(), u.user_id.clone()))
        .collect();
    if users.is_empty() {
        warn!("No gateway users configured; every request runs as the local user");
    }

    let state = Arc::new(ApiV1State {
        turns: Arc::new(turns),
        users,
    });
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Resolve the bearer token to a user and attach it to the request.
async fn auth_middleware(
    State(state): State<SharedApiState>,
    mut req: axum::extract::Request,
    next: Next,
) -> Response {
    // No configured users: a single-user local deployment.
    if state.users.is_empty() {
        req.extensions_mut().insert(AuthUser(LOCAL_USER.to_string()));
        return next.run(req).await;
    }

    let user = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.users.get(token))
        .cloned();

    match user {
        Some(user_id) => {
            req.extensions_mut().insert(AuthUser(user_id));
            next.run(req).await
        }
        None => {
            warn!("Unauthorized request to /v1 API: missing or invalid bearer token");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use deepsearch_agent::AgentLoop;
    use deepsearch_agent::test_helpers::{ScriptStep, ScriptedProvider};
    use deepsearch_core::tool::ToolRegistry;
    use deepsearch_store::InMemoryConversationStore;

    fn test_state(users: &[(&str, &str)]) -> SharedApiState {
        let agent = AgentLoop::new(
            Arc::new(ScriptedProvider::new(vec![ScriptStep::text(&["ok"])])),
            "mock-model",
            0.0,
            Arc::new(ToolRegistry::new()),
        );
        let turns = TurnService::new(Arc::new(agent), Arc::new(InMemoryConversationStore::new()));
        Arc::new(ApiV1State {
            turns: Arc::new(turns),
            users: users
                .iter()
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .collect(),
        })
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_check() {
        let app = build_router(test_state(&[("t", "alice")]));

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn v1_requires_bearer_token() {
        let app = build_router(test_state(&[("secret", "alice")]));

        let req = Request::builder()
            .uri("/v1/conversations")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "Unauthorized");
    }

    #[tokio::test]
    async fn v1_rejects_unknown_token() {
        let app = build_router(test_state(&[("secret", "alice")]));

        let req = Request::builder()
            .uri("/v1/conversations")
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn v1_accepts_known_token() {
        let app = build_router(test_state(&[("secret", "alice")]));

        let req = Request::builder()
            .uri("/v1/conversations")
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn tokens_map_to_separate_users() {
        let state = test_state(&[("a-token", "alice"), ("b-token", "bob")]);

        let req = Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header("Authorization", "Bearer a-token")
            .header("Content-Type", "application/json")
            .body(Body::from(
                r#"{"conversationId":"shared","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .unwrap();
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_string(response).await;

        let req = Request::builder()
            .uri("/v1/conversations/shared")
            .header("Authorization", "Bearer b-token")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .uri("/v1/conversations/shared")
            .header("Authorization", "Bearer a-token")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_users_means_local_user() {
        let app = build_router(test_state(&[]));

        let req = Request::builder()
            .uri("/v1/conversations")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn memory_database_needs_no_directory() {
        let mut config = AppConfig::default();
        config.store.database_url = "sqlite::memory:".into();
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.name(), "sqlite");
    }

    #[tokio::test]
    async fn sqlite_file_store_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("chats.db");
        let mut config = AppConfig::default();
        config.store.database_url = format!("sqlite://{}", db.display());

        let store = open_store(&config).await.unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(db.parent().unwrap().exists());
    }
}
