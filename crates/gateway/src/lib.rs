//! HTTP API gateway for Cortex.
//!
//! Exposes the chat endpoints (blocking and SSE), the free-form agent
//! endpoints, the model catalog and session history under `/api`, plus an
//! unauthenticated `/health`.
//!
//! Built on Axum.

pub mod api;
pub mod auth;
pub mod error;
pub mod sse;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, header};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use chrono::{DateTime, Utc};
use cortex_agent::{ChatOrchestrator, OrchestratorSettings, Stores};
use cortex_config::{AppConfig, AuthConfig};
use cortex_core::error::StoreError;
use cortex_db::{CachedSettings, SqliteStore};
use cortex_providers::{ProviderFactory, RateLimiter, RateLimiterMetrics};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state for the gateway.
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub auth: AuthConfig,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(orchestrator: Arc<ChatOrchestrator>, auth: AuthConfig) -> SharedState {
        Arc::new(Self {
            orchestrator,
            auth,
            started_at: Utc::now(),
        })
    }
}

/// Build the router with every gateway route.
///
/// Layers: bearer auth on `/api`, CORS, request body limit, HTTP trace logging.
pub fn build_router(state: SharedState, body_limit: usize) -> Router {
    let api = Router::new()
        .route("/chat/{role_id}/model/{provider}/{model_name}", post(api::chat))
        .route("/chat/{role_id}/model/{provider}/{model_name}/stream", post(api::chat_stream))
        .route("/agent/chat", post(api::agent_chat))
        .route("/agent/chat/stream", post(api::agent_chat_stream))
        .route("/models/{provider}", get(api::list_models))
        .route("/chat/sessions", get(api::list_sessions))
        .route("/chat/sessions/{session_id}/messages", get(api::session_messages))
        .route("/chat/sessions/{session_id}", delete(api::delete_session))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_user));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, api::SESSION_HEADER.clone()])
        .expose_headers([api::SESSION_HEADER.clone()])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Open the database and wire the orchestrator from configuration.
pub async fn build_state(config: &AppConfig) -> Result<SharedState, StoreError> {
    let store = Arc::new(SqliteStore::connect(&config.database.url, config.database.max_connections).await?);
    let settings = Arc::new(CachedSettings::new(store.clone(), config.llm.clone(), config.memory.clone()));
    let stores = Stores {
        chats: store.clone(),
        roles: store.clone(),
        experiences: store.clone(),
        settings,
    };
    let limiter = Arc::new(RateLimiter::new(
        config.llm.rate_limit_capacity,
        config.llm.rate_limit_refill_per_sec,
    ));
    let orchestrator = ChatOrchestrator::new(
        stores,
        Arc::new(ProviderFactory::new()),
        limiter,
        OrchestratorSettings::from(config),
    );
    Ok(AppState::new(orchestrator, config.auth.clone()))
}

/// Start the gateway HTTP server and serve until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = build_state(&config).await?;
    let app = build_router(state, config.gateway.body_limit);

    if config.auth.is_open() {
        info!("No bearer tokens configured, every request runs as the local user");
    }
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// --- Handlers ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    rate_limiter: RateLimiterMetrics,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        rate_limiter: state.orchestrator.limiter().metrics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use cortex_agent::ProviderSource;
    use cortex_config::{ChatLlmSetting, MemorySetting};
    use cortex_core::error::ProviderError;
    use cortex_core::message::Message;
    use cortex_core::provider::{ChatOptions, ChatResponse, LlmProvider, ToolDefinition};
    use cortex_core::{AgentRole, RoleStore};
    use cortex_db::InMemoryStore;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    /// Answers with the last user message echoed back.
    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn model(&self) -> &str {
            "echo-1"
        }

        async fn chat_with_tools(
            &self,
            messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<ChatResponse, ProviderError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ChatResponse {
                message: Message::assistant(format!("echo: {last}")),
                usage: None,
                model: "echo-1".into(),
            })
        }
    }

    struct EchoSource;

    #[async_trait]
    impl ProviderSource for EchoSource {
        fn build(&self, _s: &ChatLlmSetting, _p: &str, _m: &str, _o: ChatOptions) -> Arc<dyn LlmProvider> {
            Arc::new(EchoProvider)
        }

        async fn list_models(&self, _s: &ChatLlmSetting, provider: &str) -> Result<Vec<String>, ProviderError> {
            match provider {
                "openai" => Ok(vec!["gpt-4o".into(), "gpt-4o-mini".into()]),
                other => Err(ProviderError::CallFailed(format!("no catalog for {other}"))),
            }
        }
    }

    async fn app_with_tokens(tokens: &[(&str, &str)]) -> Router {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_role(&AgentRole::new("r1", "Helper", "You help."))
            .await
            .unwrap();
        let settings = Arc::new(CachedSettings::new(
            store.clone(),
            ChatLlmSetting::default(),
            MemorySetting::default(),
        ));
        let stores = Stores {
            chats: store.clone(),
            roles: store.clone(),
            experiences: store.clone(),
            settings,
        };
        let orchestrator = ChatOrchestrator::new(
            stores,
            Arc::new(EchoSource),
            Arc::new(RateLimiter::default()),
            OrchestratorSettings::default(),
        );
        let auth = AuthConfig {
            tokens: tokens
                .iter()
                .map(|(t, u)| (t.to_string(), u.to_string()))
                .collect::<HashMap<_, _>>(),
        };
        build_router(AppState::new(orchestrator, auth), 1024 * 1024)
    }

    async fn app() -> Router {
        app_with_tokens(&[]).await
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn hello() -> serde_json::Value {
        serde_json::json!({"messages": [{"role": "user", "content": "Hello"}]})
    }

    #[tokio::test]
    async fn health_endpoint() {
        let response = app().await.oneshot(get_as("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["rateLimiter"]["allowed"].is_u64());
    }

    #[tokio::test]
    async fn blocking_chat_sets_session_header() {
        let response = app()
            .await
            .oneshot(post_json("/api/chat/r1/model/openai/gpt-4o", hello()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let header = response
            .headers()
            .get("x-chat-session-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = body_json(response).await;
        assert_eq!(body["session_id"], header.as_str());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["content"], "echo: Hello");
    }

    #[tokio::test]
    async fn session_header_continues_a_session() {
        let app = app().await;
        let first = app
            .clone()
            .oneshot(post_json("/api/chat/r1/model/openai/gpt-4o", hello()))
            .await
            .unwrap();
        let sid = first.headers()["x-chat-session-id"].to_str().unwrap().to_string();

        let mut second = post_json("/api/chat/r1/model/openai/gpt-4o", hello());
        second.headers_mut().insert("x-chat-session-id", sid.parse().unwrap());
        let response = app.clone().oneshot(second).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let history = app
            .oneshot(get_as(&format!("/api/chat/sessions/{sid}/messages"), None))
            .await
            .unwrap();
        assert_eq!(body_json(history).await.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unknown_role_is_not_found() {
        let response = app()
            .await
            .oneshot(post_json("/api/chat/nope/model/openai/gpt-4o", hello()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["kind"], "not_found");
    }

    #[tokio::test]
    async fn missing_user_message_is_bad_request() {
        let body = serde_json::json!({"messages": [{"role": "assistant", "content": "hi"}]});
        let response = app()
            .await
            .oneshot(post_json("/api/chat/r1/model/openai/gpt-4o/stream", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_emits_data_frames() {
        let response = app()
            .await
            .oneshot(post_json("/api/chat/r1/model/openai/gpt-4o/stream", hello()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert!(headers["content-type"].to_str().unwrap().starts_with("text/event-stream"));
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["connection"], "keep-alive");
        assert!(headers.contains_key("x-chat-session-id"));

        let text = body_text(response).await;
        let frames: Vec<serde_json::Value> = text
            .split("\n\n")
            .filter_map(|f| f.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(frames.first().unwrap()["type"], "chunk");
        assert_eq!(frames.first().unwrap()["content"], "echo: Hello");
        assert_eq!(frames.last().unwrap()["type"], "end");
        assert_eq!(frames.last().unwrap()["data"]["output"], "echo: Hello");
    }

    #[tokio::test]
    async fn agent_chat_with_prompt_content() {
        let body = serde_json::json!({"message": "ping", "prompt_content": "You are terse."});
        let response = app().await.oneshot(post_json("/api/agent/chat", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["messages"][1]["content"], "echo: ping");
    }

    #[tokio::test]
    async fn agent_chat_needs_a_prompt_source() {
        let body = serde_json::json!({"message": "ping"});
        let response = app().await.oneshot(post_json("/api/agent/chat", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bearer_tokens_resolve_users() {
        let app = app_with_tokens(&[("tok-a", "alice"), ("tok-b", "bob")]).await;

        let response = app.clone().oneshot(get_as("/api/chat/sessions", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app
            .clone()
            .oneshot(get_as("/api/chat/sessions", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut req = post_json("/api/chat/r1/model/openai/gpt-4o", hello());
        req.headers_mut().insert("authorization", "Bearer tok-a".parse().unwrap());
        let response = app.clone().oneshot(req).await.unwrap();
        let sid = response.headers()["x-chat-session-id"].to_str().unwrap().to_string();

        let own = app
            .clone()
            .oneshot(get_as(&format!("/api/chat/sessions/{sid}/messages"), Some("tok-a")))
            .await
            .unwrap();
        assert_eq!(own.status(), StatusCode::OK);

        let other = app
            .clone()
            .oneshot(get_as(&format!("/api/chat/sessions/{sid}/messages"), Some("tok-b")))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::NOT_FOUND);

        let listed = app.oneshot(get_as("/api/chat/sessions", Some("tok-b"))).await.unwrap();
        assert!(body_json(listed).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_session_removes_history() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(post_json("/api/chat/r1/model/openai/gpt-4o", hello()))
            .await
            .unwrap();
        let sid = response.headers()["x-chat-session-id"].to_str().unwrap().to_string();

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/chat/sessions/{sid}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(get_as(&format!("/api/chat/sessions/{sid}/messages"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn model_catalog() {
        let app = app().await;
        let response = app.clone().oneshot(get_as("/api/models/openai", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["models"], serde_json::json!(["gpt-4o", "gpt-4o-mini"]));

        let response = app.oneshot(get_as("/api/models/unknown", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
