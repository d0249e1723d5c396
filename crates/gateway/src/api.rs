//! HTTP API handlers.
//!
//! Endpoints (all under `/api`, all behind bearer auth):
//!
//! - `POST   /chat/{roleId}/model/{provider}/{modelName}`         — blocking chat
//! - `POST   /chat/{roleId}/model/{provider}/{modelName}/stream`  — SSE chat
//! - `POST   /agent/chat`                                         — free-form prompt, blocking
//! - `POST   /agent/chat/stream`                                  — free-form prompt, SSE
//! - `GET    /models/{provider}`                                  — model catalog
//! - `GET    /chat/sessions`                                      — caller's sessions, newest first
//! - `GET    /chat/sessions/{sessionId}/messages`                 — ordered session history
//! - `DELETE /chat/sessions/{sessionId}`                          — delete session and messages

use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use cortex_agent::{AgentChatRequest, ChatRequest};
use cortex_core::{ChatMessage, Session};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::SharedState;
use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::sse::stream_response;

/// Carries the session id in both directions.
pub static SESSION_HEADER: HeaderName = HeaderName::from_static("x-chat-session-id");

fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn with_session_header(session_id: &str, mut response: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER.clone(), value);
    }
    response
}

// ── Chat ──────────────────────────────────────────────────────────────────

pub async fn chat(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((role_id, provider, model_name)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let session_id = session_from_headers(&headers);
    info!(user = %user, role_id = %role_id, provider = %provider, model = %model_name, "Chat request");

    // Client disconnect drops this future and the guard with it
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let reply = state
        .orchestrator
        .send_message(&user, &role_id, &provider, &model_name, session_id.as_deref(), &body, &cancel)
        .await?;
    let session_id = reply.session_id.clone();
    Ok(with_session_header(&session_id, Json(reply).into_response()))
}

pub async fn chat_stream(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((role_id, provider, model_name)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let session_id = session_from_headers(&headers);
    let input = body.user_input()?;
    info!(user = %user, role_id = %role_id, provider = %provider, model = %model_name, "Chat stream request");

    let prepared = state
        .orchestrator
        .prepare_stream_message(&user, &role_id, &provider, &model_name, session_id.as_deref(), input)
        .await?;
    Ok(stream_response(prepared)?)
}

/// Body session id first, then the header.
fn agent_request(mut body: AgentChatRequest, headers: &HeaderMap) -> AgentChatRequest {
    if body.session_id.as_deref().is_none_or(str::is_empty) {
        body.session_id = session_from_headers(headers);
    }
    body
}

pub async fn agent_chat(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(body): Json<AgentChatRequest>,
) -> Result<Response, ApiError> {
    let request = agent_request(body, &headers);
    info!(user = %user, role_id = ?request.role_id, prompt_key = ?request.prompt_key, "Agent chat request");

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let reply = state.orchestrator.agent_chat(&user, &request, &cancel).await?;
    let session_id = reply.session_id.clone();
    Ok(with_session_header(&session_id, Json(reply).into_response()))
}

pub async fn agent_chat_stream(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(body): Json<AgentChatRequest>,
) -> Result<Response, ApiError> {
    let request = agent_request(body, &headers);
    info!(user = %user, role_id = ?request.role_id, prompt_key = ?request.prompt_key, "Agent chat stream request");

    let prepared = state.orchestrator.prepare_agent_stream(&user, &request).await?;
    Ok(stream_response(prepared)?)
}

// ── Models ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub provider: String,
    pub models: Vec<String>,
}

pub async fn list_models(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
) -> Result<Json<ModelList>, ApiError> {
    let models = state.orchestrator.list_models(&provider).await?;
    Ok(Json(ModelList { provider, models }))
}

// ── Sessions ──────────────────────────────────────────────────────────────

pub async fn list_sessions(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.orchestrator.list_sessions(&user).await?))
}

pub async fn session_messages(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.orchestrator.session_messages(&user, &session_id).await?))
}

pub async fn delete_session(
    State(state): State<SharedState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_session(&user, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
