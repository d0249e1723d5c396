//! Persistence traits implemented by `cortex-db`.
//!
//! Every read that touches a session takes the caller's user id; a session
//! owned by someone else is reported as not found.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{AgentRole, ChatMessage, Experience, Session};
use crate::error::StoreError;

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Sessions and their messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> StoreResult<()>;

    /// Fetch a session owned by `user_id`.
    async fn get_session(&self, user_id: &str, session_id: &str) -> StoreResult<Session>;

    /// Rebind role, provider and model of an existing session.
    async fn update_session_binding(
        &self,
        session_id: &str,
        role_id: &str,
        role_name: &str,
        provider: &str,
        model_name: &str,
    ) -> StoreResult<()>;

    /// Sessions of `user_id`, most recently updated first.
    async fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<Session>>;

    /// Delete a session and all of its messages.
    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()>;

    /// Insert messages in the given order.
    async fn insert_messages(&self, messages: &[ChatMessage]) -> StoreResult<()>;

    /// Messages of a session owned by `user_id`, ordered by `(created_at, id)`.
    async fn list_messages(&self, user_id: &str, session_id: &str) -> StoreResult<Vec<ChatMessage>>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_role(&self, role_id: &str) -> StoreResult<AgentRole>;
    async fn save_role(&self, role: &AgentRole) -> StoreResult<()>;
}

/// Metadata filter for paginated experience search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceQuery {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// 1-based
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

impl Default for ExperienceQuery {
    fn default() -> Self {
        Self {
            kind: None,
            title: None,
            tag: None,
            created_by: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl ExperienceQuery {
    pub fn offset(&self) -> u32 {
        self.page.max(1).saturating_sub(1) * self.page_size
    }
}

/// Role-scoped experiences. Visibility is decided by the role relation.
#[async_trait]
pub trait ExperienceStore: Send + Sync {
    async fn create_experience(&self, experience: &Experience) -> StoreResult<()>;

    async fn get_experience(&self, id: &str) -> StoreResult<Experience>;

    async fn update_experience(&self, experience: &Experience) -> StoreResult<()>;

    async fn delete_experience(&self, id: &str) -> StoreResult<()>;

    /// Add the `(role_id, experience_id)` edge; idempotent.
    async fn link_role(&self, role_id: &str, experience_id: &str) -> StoreResult<()>;

    /// True when the experience is visible to the role.
    async fn is_linked(&self, role_id: &str, experience_id: &str) -> StoreResult<bool>;

    /// All experiences visible to a role.
    async fn list_for_role(&self, role_id: &str) -> StoreResult<Vec<Experience>>;

    /// Paginated metadata search; returns the page and the total match count.
    async fn search_experiences(
        &self,
        role_id: &str,
        query: &ExperienceQuery,
    ) -> StoreResult<(Vec<Experience>, u64)>;

    /// Keywords OR'd over `title` and `content` with `LIKE`.
    async fn fuzzy_search(&self, role_id: &str, keywords: &[String], limit: u32) -> StoreResult<Vec<Experience>>;
}

/// `(group, key) → value` runtime settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, group: &str, key: &str) -> StoreResult<Option<serde_json::Value>>;
    async fn set_setting(&self, group: &str, key: &str, value: &serde_json::Value) -> StoreResult<()>;
}

/// Split free text into search keywords on whitespace, dropping empties.
pub fn tokenize_keywords<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .flat_map(|s| s.as_ref().split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .collect()
}
