//! Turns a role's tool configuration into the ordered tool set of one turn.

use std::sync::Arc;
use std::time::Duration;

use cortex_core::store::ExperienceStore;
use cortex_core::tool::ToolSet;
use cortex_core::{AgentRole, RoleNotifier};
use cortex_tools::{BuiltinOptions, NotifyHumanTool, NotifyRoleTool, builtin, experience_tools, mcp};
use tracing::{debug, warn};

/// Deadline for connecting to one MCP server and listing its tools.
pub const MCP_BIND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ToolBinder {
    options: BuiltinOptions,
    http: reqwest::Client,
    experiences: Arc<dyn ExperienceStore>,
}

impl ToolBinder {
    pub fn new(options: BuiltinOptions, experiences: Arc<dyn ExperienceStore>) -> Self {
        Self {
            options,
            http: reqwest::Client::new(),
            experiences,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Experience tools, built-ins, notification tools, then MCP tools.
    ///
    /// A later tool with an existing name replaces the earlier one. Unavailable
    /// built-ins and unreachable MCP servers are logged and skipped.
    pub async fn bind(&self, user_id: &str, role: &AgentRole, notifier: Arc<dyn RoleNotifier>) -> ToolSet {
        let config = &role.tool_config;
        let mut tools = ToolSet::new();

        tools.extend(experience_tools(user_id, role.id.as_str(), self.experiences.clone()));

        for name in &config.builtin {
            match builtin(name, &self.options, config.email_config.as_ref()) {
                Ok(tool) => tools.register(tool),
                Err(e) => warn!(role_id = %role.id, tool = %name, error = %e, "Skipping built-in tool"),
            }
        }

        if !config.role_notifications.is_empty() {
            tools.register(Arc::new(NotifyRoleTool::new(
                user_id,
                &config.role_notifications,
                notifier,
            )));
        }

        if !config.human_notifications.is_empty() {
            match &config.email_config {
                Some(smtp) => tools.register(Arc::new(NotifyHumanTool::new(
                    &config.human_notifications,
                    smtp.clone(),
                ))),
                None => warn!(role_id = %role.id, "Human notifications configured without email config"),
            }
        }

        for server in &config.mcp {
            let label = if server.name.is_empty() { &server.url } else { &server.name };
            match tokio::time::timeout(MCP_BIND_TIMEOUT, mcp::load_tools(server, self.http.clone())).await {
                Ok(Ok(loaded)) => tools.extend(loaded),
                Ok(Err(e)) => warn!(role_id = %role.id, server = %label, error = %e, "MCP server unavailable"),
                Err(_) => warn!(role_id = %role.id, server = %label, "MCP connect timed out"),
            }
        }

        debug!(role_id = %role.id, tools = ?tools, "Tools bound");
        tools
    }
}
