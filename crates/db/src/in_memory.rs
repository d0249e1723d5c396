//! In-process store with the same contract as [`crate::SqliteStore`].

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use cortex_core::domain::{AgentRole, ChatMessage, Experience, Session};
use cortex_core::error::StoreError;
use cortex_core::store::{ChatStore, ExperienceQuery, ExperienceStore, RoleStore, SettingsStore};
use tokio::sync::RwLock;

type StoreResult<T> = Result<T, StoreError>;

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    /// Insertion order doubles as the tie-breaker for equal timestamps
    messages: Vec<ChatMessage>,
    roles: HashMap<String, AgentRole>,
    experiences: HashMap<String, Experience>,
    relations: BTreeSet<(String, String)>,
    settings: HashMap<(String, String), serde_json::Value>,
}

impl State {
    fn visible(&self, role_id: &str) -> Vec<&Experience> {
        let mut out: Vec<&Experience> = self
            .relations
            .iter()
            .filter(|(r, _)| r == role_id)
            .filter_map(|(_, id)| self.experiences.get(id))
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }
}

fn query_matches(e: &Experience, q: &ExperienceQuery) -> bool {
    let nonempty = |o: &Option<String>| o.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
    if let Some(kind) = nonempty(&q.kind)
        && e.kind != kind
    {
        return false;
    }
    if let Some(title) = nonempty(&q.title)
        && !contains_ci(&e.title, &title)
    {
        return false;
    }
    if let Some(tag) = nonempty(&q.tag)
        && !e.tags.contains(&tag)
    {
        return false;
    }
    if let Some(author) = nonempty(&q.created_by)
        && e.created_by != author
    {
        return false;
    }
    true
}

/// SQLite `LIKE` semantics for ASCII: case-insensitive substring.
fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(what: &str, id: &str) -> StoreError {
    StoreError::NotFound(format!("{what} {id}"))
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.state
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, user_id: &str, session_id: &str) -> StoreResult<Session> {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .filter(|s| s.user_id == user_id)
            .cloned()
            .ok_or_else(|| not_found("session", session_id))
    }

    async fn update_session_binding(
        &self,
        session_id: &str,
        role_id: &str,
        role_name: &str,
        provider: &str,
        model_name: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        session.role_id = role_id.to_string();
        session.role_name = role_name.to_string();
        session.provider = provider.to_string();
        session.model_name = model_name.to_string();
        session.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<Session>> {
        let state = self.state.read().await;
        let mut out: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.sessions.get(session_id) {
            Some(s) if s.user_id == user_id => {}
            _ => return Err(not_found("session", session_id)),
        }
        state.sessions.remove(session_id);
        state.messages.retain(|m| m.session_id != session_id);
        Ok(())
    }

    async fn insert_messages(&self, messages: &[ChatMessage]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let now = chrono::Utc::now();
        for msg in messages {
            if let Some(s) = state.sessions.get_mut(&msg.session_id) {
                s.updated_at = now;
            }
        }
        state.messages.extend_from_slice(messages);
        Ok(())
    }

    async fn list_messages(&self, user_id: &str, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        self.get_session(user_id, session_id).await?;
        let state = self.state.read().await;
        let mut out: Vec<ChatMessage> = state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }
}

#[async_trait]
impl RoleStore for InMemoryStore {
    async fn get_role(&self, role_id: &str) -> StoreResult<AgentRole> {
        self.state
            .read()
            .await
            .roles
            .get(role_id)
            .cloned()
            .ok_or_else(|| not_found("role", role_id))
    }

    async fn save_role(&self, role: &AgentRole) -> StoreResult<()> {
        self.state.write().await.roles.insert(role.id.clone(), role.clone());
        Ok(())
    }
}

#[async_trait]
impl ExperienceStore for InMemoryStore {
    async fn create_experience(&self, experience: &Experience) -> StoreResult<()> {
        self.state
            .write()
            .await
            .experiences
            .insert(experience.id.clone(), experience.clone());
        Ok(())
    }

    async fn get_experience(&self, id: &str) -> StoreResult<Experience> {
        self.state
            .read()
            .await
            .experiences
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("experience", id))
    }

    async fn update_experience(&self, experience: &Experience) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let slot = state
            .experiences
            .get_mut(&experience.id)
            .ok_or_else(|| not_found("experience", &experience.id))?;
        *slot = experience.clone();
        Ok(())
    }

    async fn delete_experience(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .experiences
            .remove(id)
            .ok_or_else(|| not_found("experience", id))?;
        state.relations.retain(|(_, e)| e != id);
        Ok(())
    }

    async fn link_role(&self, role_id: &str, experience_id: &str) -> StoreResult<()> {
        self.state
            .write()
            .await
            .relations
            .insert((role_id.to_string(), experience_id.to_string()));
        Ok(())
    }

    async fn is_linked(&self, role_id: &str, experience_id: &str) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state.experiences.contains_key(experience_id)
            && state
                .relations
                .contains(&(role_id.to_string(), experience_id.to_string())))
    }

    async fn list_for_role(&self, role_id: &str) -> StoreResult<Vec<Experience>> {
        let state = self.state.read().await;
        Ok(state.visible(role_id).into_iter().cloned().collect())
    }

    async fn search_experiences(
        &self,
        role_id: &str,
        query: &ExperienceQuery,
    ) -> StoreResult<(Vec<Experience>, u64)> {
        let state = self.state.read().await;
        let hits: Vec<&Experience> = state
            .visible(role_id)
            .into_iter()
            .filter(|e| query_matches(e, query))
            .collect();
        let total = hits.len() as u64;
        let page = hits
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size.max(1) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn fuzzy_search(&self, role_id: &str, keywords: &[String], limit: u32) -> StoreResult<Vec<Experience>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .visible(role_id)
            .into_iter()
            .filter(|e| {
                keywords
                    .iter()
                    .any(|k| contains_ci(&e.title, k) || contains_ci(&e.content, k))
            })
            .take(limit.max(1) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingsStore for InMemoryStore {
    async fn get_setting(&self, group: &str, key: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self
            .state
            .read()
            .await
            .settings
            .get(&(group.to_string(), key.to_string()))
            .cloned())
    }

    async fn set_setting(&self, group: &str, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        self.state
            .write()
            .await
            .settings
            .insert((group.to_string(), key.to_string()), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::message::Role;

    #[tokio::test]
    async fn cross_user_reads_are_not_found() {
        let store = InMemoryStore::new();
        let role = AgentRole::new("r", "R", "p");
        let s = Session::new("alice", &role, "openai", "m", None);
        store.create_session(&s).await.unwrap();
        store
            .insert_messages(&[ChatMessage::new(&s.id, Role::User, "hello")])
            .await
            .unwrap();

        assert_eq!(store.list_messages("alice", &s.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.list_messages("mallory", &s.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn experiences_follow_the_relation() {
        let store = InMemoryStore::new();
        let e = Experience::new("howto", "Deploy", "run the script", "alice");
        store.create_experience(&e).await.unwrap();
        assert!(store.list_for_role("r").await.unwrap().is_empty());

        store.link_role("r", &e.id).await.unwrap();
        assert_eq!(store.list_for_role("r").await.unwrap().len(), 1);
        assert_eq!(store.fuzzy_search("r", &["SCRIPT".to_string()], 5).await.unwrap().len(), 1);
        assert!(store.fuzzy_search("other", &["script".to_string()], 5).await.unwrap().is_empty());

        store.delete_experience(&e.id).await.unwrap();
        assert!(!store.is_linked("r", &e.id).await.unwrap());
    }
}
