//! Persisted domain records: sessions, chat messages, roles, experiences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Role;

/// Maximum session title length, in Unicode code points.
pub const TITLE_MAX_CHARS: usize = 50;

/// A conversation thread, owned by one user and pinned to one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque 36-char id
    pub id: String,
    pub user_id: String,
    pub role_id: String,
    /// Role name snapshot taken at creation
    pub role_name: String,
    pub provider: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        role: &AgentRole,
        provider: impl Into<String>,
        model_name: impl Into<String>,
        first_message: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            role_id: role.id.clone(),
            role_name: role.name.clone(),
            provider: provider.into(),
            model_name: model_name.into(),
            title: first_message.map(truncate_title).filter(|t| !t.is_empty()),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the stored binding differs from the requested one.
    pub fn binding_differs(&self, role_id: &str, provider: &str, model_name: &str) -> bool {
        self.role_id != role_id || self.provider != provider || self.model_name != model_name
    }
}

/// Truncate to [`TITLE_MAX_CHARS`] code points, never splitting a character.
pub fn truncate_title(text: &str) -> String {
    text.trim().chars().take(TITLE_MAX_CHARS).collect()
}

/// One persisted chat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    /// Possibly empty when the assistant only requested tool calls
    pub content: String,
    /// Tool-call trace, token usage, error, referenced experience ids
    #[serde(default)]
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            meta: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// An agent persona: system prompt plus permitted tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRole {
    pub id: String,
    pub name: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principle: Option<String>,
    #[serde(default)]
    pub tool_config: ToolConfig,
    #[serde(default)]
    pub is_public: bool,
    pub creator_id: String,
}

impl AgentRole {
    pub fn new(id: impl Into<String>, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt: prompt.into(),
            principle: None,
            tool_config: ToolConfig::default(),
            is_public: false,
            creator_id: String::new(),
        }
    }
}

/// Declarative tool configuration of a role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    /// Built-in tool names, e.g. `get_time`, `command`
    #[serde(default)]
    pub builtin: Vec<String>,

    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_config: Option<SmtpConfig>,

    #[serde(default)]
    pub role_notifications: Vec<RoleNotification>,

    #[serde(default)]
    pub human_notifications: Vec<HumanNotification>,
}

/// One remote MCP tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// `"http"` (streamable HTTP, falls back to SSE) or `"sse"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    /// Allow-list of tool names; empty admits every tool the server lists
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

/// SMTP credentials for `send_email` and `notify_human`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Sender address; defaults to the username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Implicit TLS (465) when true, STARTTLS otherwise
    #[serde(default)]
    pub use_tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

impl SmtpConfig {
    pub fn sender(&self) -> &str {
        self.from.as_deref().unwrap_or(&self.username)
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from", &self.from)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Allowed target roles for `notify_role`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleNotification {
    #[serde(default)]
    pub target_role_ids: Vec<String>,
    /// Natural-language trigger condition, shown to the model
    #[serde(default)]
    pub condition: String,
}

/// Allowed target addresses for `notify_human`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanNotification {
    #[serde(default)]
    pub target_emails: Vec<String>,
    #[serde(default)]
    pub condition: String,
}

/// A role-scoped long-term memory fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experience {
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            title: title.into(),
            content: content.into(),
            tags: Vec::new(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
