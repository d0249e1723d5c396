use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cortex_core::error::ProviderError;
use cortex_core::message::Message;
use cortex_core::provider::{ChatResponse, LlmProvider, ToolDefinition};

/// Returns a fixed summary, or fails when built with `failing()`.
pub struct SummaryStub {
    summary: Option<String>,
    calls: AtomicUsize,
}

impl SummaryStub {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: Some(summary.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            summary: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for SummaryStub {
    fn name(&self) -> &str {
        "summary-stub"
    }

    fn model(&self) -> &str {
        "stub"
    }

    async fn chat_with_tools(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.summary {
            Some(s) => Ok(ChatResponse {
                message: Message::assistant(s.clone()),
                usage: None,
                model: "stub".into(),
            }),
            None => Err(ProviderError::CallFailed("summarizer offline".into())),
        }
    }
}
