//! `command` — execute a shell command.
//!
//! Captures stdout, stderr and the exit code. A command that outlives its
//! timeout is killed and reported as `TOOL_EXECUTION_TIMEOUT`.

use std::time::Duration;

use async_trait::async_trait;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;
use tokio::process::Command;
use tracing::{debug, warn};

pub const NAME: &str = "command";

pub struct CommandTool {
    default_timeout: Duration,
    /// If non-empty, only these base commands are allowed.
    allowed_commands: Vec<String>,
}

impl CommandTool {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            allowed_commands: Vec::new(),
        }
    }

    pub fn with_allowlist(mut self, allowed_commands: Vec<String>) -> Self {
        self.allowed_commands = allowed_commands;
        self
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        let base_cmd = command.split_whitespace().next().unwrap_or("").trim();
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Execute a shell command on the server and return its stdout, stderr and exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Kill the command after this many seconds"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let command = arguments["command"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: NAME.into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        let timeout = arguments["timeout_secs"]
            .as_u64()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(cwd) = arguments["cwd"].as_str() {
            cmd.current_dir(cwd);
        }
        cmd.kill_on_drop(true);

        debug!(command = %command, timeout_secs = timeout.as_secs(), "Executing command");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: NAME.into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: NAME.into(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            warn!(command = %command, exit_code, "Command failed");
        }

        Ok(serde_json::json!({
            "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
            "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
            "exit_code": exit_code,
        }))
    }
}
