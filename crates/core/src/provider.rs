//! LLM provider trait — the abstraction over chat-completion backends.
//!
//! A provider is bound to one `(endpoint, api key, model)` triple and knows
//! how to send a conversation to the LLM, either for a complete message or
//! as a stream of events.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{Message, ToolCall};

/// Sampling options applied to every request a provider makes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Deadline of one request attempt; retry back-off is not counted
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: Some(4096),
            stop: Vec::new(),
            timeout: None,
        }
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated assistant message (tool-call arguments already decoded)
    pub message: Message,

    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// One event of a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial content delta
    Chunk { content: String },

    /// The aggregated tool calls of the response, emitted once before `End`
    ToolCalls {
        #[serde(rename = "toolCalls")]
        tool_calls: Vec<ToolCall>,
    },

    /// Informational notice (e.g. rate limited, sleeping before retry)
    Info { message: String },

    /// A new attempt is starting after a retryable failure
    Retry { attempt: u32 },

    /// Terminal failure
    Error { error: String },

    /// Terminal success
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

/// Receiving half of a provider stream.
pub type StreamReceiver = mpsc::Receiver<StreamEvent>;

/// The core LLM provider trait.
///
/// The agent engine calls `chat_with_tools()` or `chat_with_tools_stream()`
/// without knowing which backend is in use.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// A human-readable provider name (e.g., "openai", "deepseek").
    fn name(&self) -> &str;

    /// The model this provider instance is bound to.
    fn model(&self) -> &str;

    /// One-shot completion.
    async fn chat(&self, messages: &[Message]) -> Result<ChatResponse, ProviderError> {
        self.chat_with_tools(messages, &[]).await
    }

    /// Token streaming without tools.
    async fn chat_stream(&self, messages: &[Message]) -> Result<StreamReceiver, ProviderError> {
        self.chat_with_tools_stream(messages, &[]).await
    }

    /// Completion that may return tool calls.
    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ProviderError>;

    /// Streaming completion that may return tool calls.
    ///
    /// Default implementation calls `chat_with_tools()` and replays the
    /// result as `chunk` → `tool_calls` → `end`.
    async fn chat_with_tools_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<StreamReceiver, ProviderError> {
        let response = self.chat_with_tools(messages, tools).await?;
        let (tx, rx) = mpsc::channel(4);
        if !response.message.content.is_empty() {
            let _ = tx
                .send(StreamEvent::Chunk {
                    content: response.message.content.clone(),
                })
                .await;
        }
        if !response.message.tool_calls.is_empty() {
            let _ = tx
                .send(StreamEvent::ToolCalls {
                    tool_calls: response.message.tool_calls,
                })
                .await;
        }
        let _ = tx.send(StreamEvent::End { usage: response.usage }).await;
        Ok(rx)
    }

    /// List available models for this provider's endpoint.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }
}
