//! Bearer token → user resolution.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use cortex_core::Error;
use tracing::warn;

use crate::SharedState;
use crate::error::ApiError;

/// The user every request runs as when no tokens are configured.
pub const LOCAL_USER: &str = "local";

/// The authenticated caller, placed in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

/// Resolve `Authorization: Bearer <token>` to a user id.
pub async fn require_user(State(state): State<SharedState>, mut req: Request, next: Next) -> Response {
    let user = if state.auth.is_open() {
        LOCAL_USER.to_string()
    } else {
        let token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        match token.and_then(|t| state.auth.user_for(t)) {
            Some(user) => user.to_string(),
            None => {
                warn!(path = %req.uri().path(), "Missing or invalid bearer token");
                return ApiError(Error::Unauthorized("missing or invalid bearer token".into())).into_response();
            }
        }
    };

    req.extensions_mut().insert(CurrentUser(user));
    next.run(req).await
}
