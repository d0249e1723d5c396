//! Error kind → HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use cortex_core::{Error, ErrorKind};
use serde::Serialize;
use tracing::{debug, error, warn};

/// nginx's "client closed request"; never seen by a client that left.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// A domain error on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::LlmFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::AgentBusy => StatusCode::CONFLICT,
        ErrorKind::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::REQUEST_TIMEOUT)
        }
        ErrorKind::ToolFailure | ErrorKind::MemoryFailure | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BadRequest => "bad_request",
        ErrorKind::Unauthorized => "unauthorized",
        ErrorKind::NotFound => "not_found",
        ErrorKind::LlmFailure => "llm_failure",
        ErrorKind::ToolFailure => "tool_failure",
        ErrorKind::AgentBusy => "agent_busy",
        ErrorKind::MemoryFailure => "memory_failure",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Internal => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        match kind {
            ErrorKind::Cancelled => debug!(error = %self.0, "Request cancelled"),
            _ if status.is_server_error() => error!(status = status.as_u16(), error = %self.0, "Request failed"),
            _ => warn!(status = status.as_u16(), error = %self.0, "Request rejected"),
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: kind_name(kind),
        };
        (status, Json(body)).into_response()
    }
}
