//! Agent-level streaming events and the turn result.
//!
//! `AgentEvent` wraps provider stream events into what the gateway forwards
//! to clients over SSE:
//! - `chunk`      — partial text from the LLM
//! - `tool_calls` — the tool calls of one iteration
//! - `info`       — progress notices such as rate-limit retries
//! - `end`        — the turn is complete, carries the [`AgentResult`]
//! - `error`      — terminal failure or cancellation

use cortex_core::message::{Message, ToolCall};
use cortex_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// One tool invocation as it happened during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallTrace {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cached: bool,
    pub duration_ms: u64,
}

/// What one engine turn produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub output: String,
    pub iterations: u32,
    pub tool_calls: Vec<ToolCallTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Messages appended after the user input, in order
    #[serde(skip)]
    pub transcript: Vec<Message>,
}

impl AgentResult {
    /// The diagnostic trace stored in the assistant message `meta`.
    pub fn meta(&self) -> serde_json::Value {
        serde_json::json!({
            "toolCalls": self.tool_calls,
            "iterations": self.iterations,
            "usage": self.usage,
        })
    }
}

/// Events emitted by the engine during streaming execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Chunk {
        content: String,
    },

    ToolCalls {
        #[serde(rename = "toolCalls")]
        tool_calls: Vec<ToolCall>,
    },

    Info {
        message: String,
    },

    End {
        data: AgentResult,
    },

    Error {
        error: String,
    },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCalls { .. } => "tool_calls",
            Self::Info { .. } => "info",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_wire_shape() {
        let json = serde_json::to_string(&AgentEvent::Chunk {
            content: "Hello".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"chunk","content":"Hello"}"#);
    }

    #[test]
    fn tool_calls_use_camel_case_key() {
        let call = ToolCall::new("c1", "get_time", serde_json::Map::new());
        let json = serde_json::to_value(AgentEvent::ToolCalls { tool_calls: vec![call] }).unwrap();
        assert_eq!(json["type"], "tool_calls");
        assert_eq!(json["toolCalls"][0]["function"]["name"], "get_time");
    }

    #[test]
    fn end_carries_result_without_transcript() {
        let result = AgentResult {
            output: "done".into(),
            iterations: 2,
            transcript: vec![Message::assistant("done")],
            ..Default::default()
        };
        let json = serde_json::to_value(AgentEvent::End { data: result }).unwrap();
        assert_eq!(json["type"], "end");
        assert_eq!(json["data"]["output"], "done");
        assert_eq!(json["data"]["iterations"], 2);
        assert!(json["data"].get("transcript").is_none());
    }

    #[test]
    fn terminal_events() {
        assert!(AgentEvent::Error { error: "x".into() }.is_terminal());
        assert!(!AgentEvent::Info { message: "x".into() }.is_terminal());
        assert_eq!(AgentEvent::Info { message: "x".into() }.event_type(), "info");
    }

    #[test]
    fn meta_lists_tool_calls() {
        let result = AgentResult {
            tool_calls: vec![ToolCallTrace {
                id: "c1".into(),
                name: "get_time".into(),
                args: serde_json::json!({"timezone": "UTC"}),
                result: Some(serde_json::json!({"time": "now"})),
                error: None,
                cached: false,
                duration_ms: 3,
            }],
            iterations: 1,
            ..Default::default()
        };
        let meta = result.meta();
        assert_eq!(meta["toolCalls"][0]["durationMs"], 3);
        assert_eq!(meta["iterations"], 1);
    }
}
