//! In-process backend — useful for testing and single-node deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::MemoryError;
use cortex_core::memory::{MemoryProvider, apply_window};
use cortex_core::message::{Message, Role};
use cortex_core::provider::LlmProvider;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::compression;

type History = Arc<Mutex<Vec<Message>>>;

/// Process-wide store shared by every `SimpleMemory` handle.
#[derive(Default)]
pub struct SimpleMemoryStore {
    sessions: RwLock<HashMap<String, History>>,
}

impl SimpleMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn history(&self, session_id: &str) -> History {
        if let Some(h) = self.sessions.read().await.get(session_id) {
            return h.clone();
        }
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Bind a provider to one session.
    pub fn open(self: &Arc<Self>, session_id: impl Into<String>, max_history: usize) -> SimpleMemory {
        SimpleMemory {
            store: self.clone(),
            session_id: session_id.into(),
            max_history,
        }
    }
}

/// Memory provider over [`SimpleMemoryStore`].
pub struct SimpleMemory {
    store: Arc<SimpleMemoryStore>,
    session_id: String,
    max_history: usize,
}

impl SimpleMemory {
    /// Append messages without the user/assistant pairing, trimming the head.
    pub async fn append(&self, messages: Vec<Message>) {
        let history = self.store.history(&self.session_id).await;
        let mut guard = history.lock().await;
        guard.extend(messages);
        trim_head(&mut guard, self.max_history);
    }
}

/// Drop the oldest non-system messages until the list fits.
fn trim_head(list: &mut Vec<Message>, max: usize) {
    while list.len() > max {
        match list.iter().position(|m| m.role != Role::System) {
            Some(idx) => {
                list.remove(idx);
            }
            None => break,
        }
    }
}

#[async_trait]
impl MemoryProvider for SimpleMemory {
    fn name(&self) -> &str {
        "simple"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn save_context(&self, input: Option<&str>, output: Option<&str>) -> Result<(), MemoryError> {
        let mut batch = Vec::with_capacity(2);
        if let Some(text) = input {
            batch.push(Message::user(text));
        }
        if let Some(text) = output {
            batch.push(Message::assistant(text));
        }
        if !batch.is_empty() {
            self.append(batch).await;
        }
        Ok(())
    }

    async fn get_chat_history(&self) -> Result<Vec<Message>, MemoryError> {
        let history = self.store.history(&self.session_id).await;
        let snapshot = history.lock().await.clone();
        Ok(apply_window(snapshot, self.max_history))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let history = self.store.history(&self.session_id).await;
        history.lock().await.clear();
        Ok(())
    }

    async fn compress_memory(&self, llm: &dyn LlmProvider, max_messages: usize) -> Result<bool, MemoryError> {
        let history = self.store.history(&self.session_id).await;
        let snapshot = history.lock().await.clone();
        let Some(part) = compression::partition(&snapshot, max_messages) else {
            return Ok(false);
        };

        // Lock released across the LLM call
        let summary = compression::summarize(llm, &part.old).await?;

        let mut guard = history.lock().await;
        match compression::reconcile(&snapshot, &part, &summary, &guard, max_messages) {
            Some(replacement) => {
                debug!(
                    session_id = %self.session_id,
                    before = guard.len(),
                    after = replacement.len(),
                    "Compressed in-process memory"
                );
                *guard = replacement;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SummaryStub;

    fn open(max: usize) -> SimpleMemory {
        Arc::new(SimpleMemoryStore::new()).open("s1", max)
    }

    #[tokio::test]
    async fn save_context_orders_user_then_assistant() {
        let mem = open(100);
        mem.save_context(Some("hi"), Some("hello")).await.unwrap();
        mem.save_context(Some("bye"), None).await.unwrap();
        let h = mem.get_chat_history().await.unwrap();
        let roles: Vec<Role> = h.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(h[2].content, "bye");
    }

    #[tokio::test]
    async fn overflow_trims_oldest() {
        let mem = open(4);
        for i in 0..6 {
            mem.save_context(Some(&format!("q{i}")), None).await.unwrap();
        }
        let h = mem.load_memory_variables().await.unwrap().history;
        assert_eq!(h.len(), 4);
        assert_eq!(h[0].content, "q2");
    }

    #[tokio::test]
    async fn sessions_are_isolated_and_clear() {
        let store = Arc::new(SimpleMemoryStore::new());
        let a = store.open("a", 10);
        let b = store.open("b", 10);
        a.save_context(Some("for a"), None).await.unwrap();
        assert!(b.get_chat_history().await.unwrap().is_empty());
        a.clear().await.unwrap();
        assert!(a.get_chat_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compress_noop_is_byte_equal() {
        let mem = open(100);
        for i in 0..10 {
            mem.save_context(Some(&format!("q{i}")), Some(&format!("a{i}"))).await.unwrap();
        }
        let before = serde_json::to_vec(&mem.get_chat_history().await.unwrap()).unwrap();
        let stub = SummaryStub::new("SUM");
        assert!(!mem.compress_memory(&stub, 20).await.unwrap());
        let after = serde_json::to_vec(&mem.get_chat_history().await.unwrap()).unwrap();
        assert_eq!(before, after);
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn compress_replaces_old_turns() {
        let mem = open(100);
        let seeds: Vec<Message> = (0..120).map(|i| Message::user(format!("m{i}"))).collect();
        mem.append(seeds.clone()).await;

        let stub = SummaryStub::new("SUM");
        assert!(mem.compress_memory(&stub, 50).await.unwrap());

        let h = mem.get_chat_history().await.unwrap();
        assert_eq!(h.len(), 51);
        assert_eq!(h[0].role, Role::System);
        assert_eq!(h[0].content, "Previous conversation summary: SUM");
        assert_eq!(h[1..], seeds[70..]);
    }

    #[tokio::test]
    async fn failed_summary_leaves_memory_unchanged() {
        let mem = open(100);
        for i in 0..30 {
            mem.save_context(Some(&format!("q{i}")), None).await.unwrap();
        }
        let before = mem.get_chat_history().await.unwrap();
        let stub = SummaryStub::failing();
        assert!(mem.compress_memory(&stub, 10).await.is_err());
        assert_eq!(mem.get_chat_history().await.unwrap(), before);
    }
}
