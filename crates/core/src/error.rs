//! Error types for the Cortex domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; [`ErrorKind`] is the
//! caller-facing grouping the gateway maps onto HTTP status codes.

use thiserror::Error;

/// The top-level error type for all Cortex operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Caller-facing ---
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("AGENT_BUSY: agent is already executing a turn")]
    AgentBusy,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing error grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    NotFound,
    LlmFailure,
    ToolFailure,
    AgentBusy,
    MemoryFailure,
    Cancelled,
    Internal,
}

impl Error {
    /// Classify this error for surfacing to a caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(ProviderError::Cancelled) => ErrorKind::Cancelled,
            Self::Provider(_) => ErrorKind::LlmFailure,
            Self::Memory(_) => ErrorKind::MemoryFailure,
            Self::Tool(_) => ErrorKind::ToolFailure,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::Internal,
            Self::Config { .. } | Self::Internal(_) => ErrorKind::Internal,
            Self::Serialization(_) | Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AgentBusy => ErrorKind::AgentBusy,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider (429): {message}")]
    RateLimited { message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("LLM_NO_RESPONSE: provider returned no choices")]
    NoResponse,

    #[error("LLM_CALL_FAILED: {0}")]
    CallFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request cancelled")]
    Cancelled,

    /// An error a streaming provider already rendered into an `error` event.
    #[error("{0}")]
    Reported(String),
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Backend not available: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("TOOL_EXECUTION_TIMEOUT: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name} — {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("MCP server not connected: {0}")]
    McpNotConnected(String),
}

impl ToolError {
    /// Network failures, timeouts and rate limits are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout { .. } | Self::RateLimited(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
