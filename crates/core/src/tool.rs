//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world:
//! run shell commands, read/write files, call MCP servers, notify
//! other roles, etc.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Default byte budget for a serialized tool result.
pub const DEFAULT_MAX_TRUNCATION: usize = 2048;

/// Where a tool comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    #[default]
    Builtin,
    Mcp,
    Http,
}

/// Static metadata attached to every tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub tool_type: ToolType,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Results longer than this many bytes are truncated before re-injection
    pub max_truncation_length: usize,
}

impl Default for ToolMetadata {
    fn default() -> Self {
        Self {
            tool_type: ToolType::Builtin,
            priority: 0,
            dependencies: Vec::new(),
            max_truncation_length: DEFAULT_MAX_TRUNCATION,
        }
    }
}

impl ToolMetadata {
    pub fn mcp() -> Self {
        Self {
            tool_type: ToolType::Mcp,
            ..Self::default()
        }
    }
}

/// The core Tool trait.
///
/// Arguments arrive as an untyped JSON object; each tool decodes and
/// validates the fields it needs.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "command", "get_time").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::default()
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// An ordered set of tools with unique names.
///
/// Registering a tool whose name is already present replaces the earlier
/// entry in place, so the binder's order is what the LLM sees.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(idx) => self.tools[idx] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn extend<I: IntoIterator<Item = Arc<dyn Tool>>>(&mut self, tools: I) {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Echoes back a fixed reply"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!(self.reply))
        }
    }

    fn echo(name: &'static str, reply: &'static str) -> Arc<dyn Tool> {
        Arc::new(EchoTool { name, reply })
    }

    #[test]
    fn registration_keeps_order() {
        let mut set = ToolSet::new();
        set.register(echo("b", "1"));
        set.register(echo("a", "2"));
        set.register(echo("c", "3"));
        assert_eq!(set.names(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn duplicate_replaces_in_place() {
        let mut set = ToolSet::new();
        set.register(echo("first", "old"));
        set.register(echo("second", "x"));
        set.register(echo("first", "new"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.names(), vec!["first", "second"]);
        let out = set.get("first").unwrap().execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out, serde_json::json!("new"));
    }

    #[test]
    fn default_metadata() {
        let meta = echo("x", "y").metadata();
        assert_eq!(meta.tool_type, ToolType::Builtin);
        assert_eq!(meta.max_truncation_length, 2048);
    }
}
