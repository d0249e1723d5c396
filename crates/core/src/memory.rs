//! Memory trait — the per-session conversation window fed to the LLM.
//!
//! A memory provider is bound to one session at construction and stores the
//! LLM-facing history for it. Backends (in-process, SQL, document,
//! key-value) live in `cortex-memory`; the agent engine only sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::Message;
use crate::provider::LlmProvider;

/// Default window size when no memory setting overrides it.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// The variables a memory provider contributes to a prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryVariables {
    pub history: Vec<Message>,
}

/// The core memory provider trait.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Backend name (e.g., "simple", "sqlite", "redis").
    fn name(&self) -> &str;

    /// The session this provider is bound to.
    fn session_id(&self) -> &str;

    /// At most `max_history` messages, oldest first, leading system messages kept.
    async fn load_memory_variables(&self) -> Result<MemoryVariables, MemoryError> {
        Ok(MemoryVariables {
            history: self.get_chat_history().await?,
        })
    }

    /// Append the user input (if any) then the assistant output (if any) atomically.
    async fn save_context(&self, input: Option<&str>, output: Option<&str>) -> Result<(), MemoryError>;

    /// Same window as `load_memory_variables`, flat.
    async fn get_chat_history(&self) -> Result<Vec<Message>, MemoryError>;

    /// Remove every message of the bound session.
    async fn clear(&self) -> Result<(), MemoryError>;

    /// Summarize everything older than the last `max_messages` turns.
    ///
    /// Returns `Ok(false)` when the history already fits and nothing changed.
    async fn compress_memory(&self, llm: &dyn LlmProvider, max_messages: usize) -> Result<bool, MemoryError>;
}

/// Apply the history window: leading system messages stay, then the newest
/// `max - |system|` of the rest.
pub fn apply_window(messages: Vec<Message>, max: usize) -> Vec<Message> {
    if messages.len() <= max {
        return messages;
    }
    let lead = messages
        .iter()
        .take_while(|m| m.role == crate::message::Role::System)
        .count();
    let keep_rest = max.saturating_sub(lead);
    let mut out: Vec<Message> = messages[..lead.min(max)].to_vec();
    let rest = &messages[lead..];
    out.extend_from_slice(&rest[rest.len().saturating_sub(keep_rest)..]);
    out
}
