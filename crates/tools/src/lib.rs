//! Tool implementations for Cortex.
//!
//! Built-ins are picked by name from a role's tool configuration. The
//! experience tools, the notification tools and MCP tools are bound per
//! request by the agent's tool binder.

pub mod command;
pub mod email;
pub mod experience;
pub mod file;
pub mod math;
pub mod mcp;
pub mod net_check;
pub mod notify;
pub mod ssh;
pub mod time;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cortex_core::SmtpConfig;
use cortex_core::tool::Tool;

pub use experience::experience_tools;
pub use notify::{NotifyHumanTool, NotifyRoleTool};

/// Names accepted in `toolConfig.builtin`.
pub const BUILTIN_NAMES: [&str; 7] = [
    email::NAME,
    command::NAME,
    file::NAME,
    math::NAME,
    net_check::NAME,
    ssh::NAME,
    time::NAME,
];

/// Process-wide settings of the built-ins.
#[derive(Debug, Clone)]
pub struct BuiltinOptions {
    pub command_timeout: Duration,
    pub file_root: Option<PathBuf>,
}

impl Default for BuiltinOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            file_root: None,
        }
    }
}

/// Why a requested built-in was not created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuiltinUnavailable {
    #[error("unknown built-in tool '{0}'")]
    Unknown(String),
    #[error("'send_email' requires an email configuration")]
    MissingEmailConfig,
}

/// Instantiate a built-in by name.
pub fn builtin(
    name: &str,
    options: &BuiltinOptions,
    email: Option<&SmtpConfig>,
) -> Result<Arc<dyn Tool>, BuiltinUnavailable> {
    let tool: Arc<dyn Tool> = match name {
        email::NAME => {
            let smtp = email.ok_or(BuiltinUnavailable::MissingEmailConfig)?;
            Arc::new(email::SendEmailTool::new(smtp.clone()))
        }
        command::NAME => Arc::new(command::CommandTool::new(options.command_timeout)),
        file::NAME => Arc::new(file::FileTool::new(options.file_root.clone())),
        math::NAME => Arc::new(math::MathTool),
        net_check::NAME => Arc::new(net_check::NetCheckTool),
        ssh::NAME => Arc::new(ssh::SshTool::new(options.command_timeout)),
        time::NAME => Arc::new(time::TimeTool),
        other => return Err(BuiltinUnavailable::Unknown(other.to_string())),
    };
    Ok(tool)
}
