//! `ssh` — run a command on a remote host.
//!
//! Authentication by password, private key file, or the local ssh-agent.
//! libssh2 is blocking, so each call runs on the blocking pool under an
//! overall deadline.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;
use tracing::{debug, warn};

pub const NAME: &str = "ssh";

const DEFAULT_PORT: u16 = 22;

pub struct SshTool {
    default_timeout: Duration,
}

impl SshTool {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

enum Auth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

struct Request {
    host: String,
    port: u16,
    username: String,
    auth: Auth,
    command: String,
    timeout: Duration,
}

impl Request {
    fn parse(args: &serde_json::Value, default_timeout: Duration) -> Result<Self, ToolError> {
        let field = |key: &str| {
            args[key]
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let missing = |key: &str| ToolError::InvalidArguments(format!("Missing '{key}' argument"));

        let auth = if let Some(password) = args["password"].as_str() {
            Auth::Password(password.to_string())
        } else if let Some(path) = field("private_key_path") {
            Auth::Key {
                path: PathBuf::from(path),
                passphrase: args["passphrase"].as_str().map(str::to_string),
            }
        } else {
            Auth::Agent
        };

        Ok(Self {
            host: field("host").ok_or_else(|| missing("host"))?,
            port: args["port"]
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(DEFAULT_PORT),
            username: field("username").ok_or_else(|| missing("username"))?,
            auth,
            command: field("command").ok_or_else(|| missing("command"))?,
            timeout: args["timeout_secs"]
                .as_u64()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        })
    }
}

fn failed(reason: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: NAME.into(),
        reason: reason.to_string(),
    }
}

fn run_blocking(req: &Request) -> Result<serde_json::Value, ToolError> {
    let tcp = TcpStream::connect((req.host.as_str(), req.port))
        .map_err(|e| ToolError::Network(format!("{}:{}: {e}", req.host, req.port)))?;
    let mut session = ssh2::Session::new().map_err(failed)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(req.timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake().map_err(failed)?;

    let auth = match &req.auth {
        Auth::Password(password) => session.userauth_password(&req.username, password),
        Auth::Key { path, passphrase } => {
            session.userauth_pubkey_file(&req.username, None, path, passphrase.as_deref())
        }
        Auth::Agent => session.userauth_agent(&req.username),
    };
    auth.map_err(|e| ToolError::PermissionDenied {
        tool_name: NAME.into(),
        reason: format!("authentication failed for {}: {e}", req.username),
    })?;

    let mut channel = session.channel_session().map_err(failed)?;
    channel.exec(&req.command).map_err(failed)?;
    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).map_err(failed)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).map_err(failed)?;
    channel.wait_close().map_err(failed)?;
    let exit_code = channel.exit_status().map_err(failed)?;

    Ok(serde_json::json!({
        "host": req.host,
        "stdout": stdout.trim_end(),
        "stderr": stderr.trim_end(),
        "exit_code": exit_code,
    }))
}

#[async_trait]
impl Tool for SshTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Run a command on a remote host over SSH (password, private key, or ssh-agent authentication)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "host": { "type": "string" },
                "port": { "type": "integer", "description": "Default 22" },
                "username": { "type": "string" },
                "password": { "type": "string", "description": "Password authentication" },
                "private_key_path": { "type": "string", "description": "Key file authentication" },
                "passphrase": { "type": "string", "description": "Passphrase of the key file" },
                "command": { "type": "string" },
                "timeout_secs": { "type": "integer" }
            },
            "required": ["host", "username", "command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let req = Request::parse(&arguments, self.default_timeout)?;
        let timeout = req.timeout;
        debug!(host = %req.host, port = req.port, user = %req.username, "SSH exec");

        let task = tokio::task::spawn_blocking(move || run_blocking(&req));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(failed(join)),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "SSH command timed out");
                Err(ToolError::Timeout {
                    tool_name: NAME.into(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_selection() {
        let d = Duration::from_secs(10);
        let pw = Request::parse(
            &serde_json::json!({"host": "h", "username": "u", "command": "ls", "password": "x"}),
            d,
        )
        .unwrap();
        assert!(matches!(pw.auth, Auth::Password(_)));
        assert_eq!(pw.port, 22);

        let key = Request::parse(
            &serde_json::json!({"host": "h", "username": "u", "command": "ls", "private_key_path": "/k", "port": 2222}),
            d,
        )
        .unwrap();
        assert!(matches!(key.auth, Auth::Key { .. }));
        assert_eq!(key.port, 2222);

        let agent =
            Request::parse(&serde_json::json!({"host": "h", "username": "u", "command": "ls"}), d).unwrap();
        assert!(matches!(agent.auth, Auth::Agent));
    }

    #[test]
    fn missing_fields() {
        let d = Duration::from_secs(10);
        assert!(Request::parse(&serde_json::json!({"host": "h", "command": "ls"}), d).is_err());
        assert!(Request::parse(&serde_json::json!({"host": "h", "username": "u"}), d).is_err());
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = SshTool::new(Duration::from_secs(5))
            .execute(serde_json::json!({
                "host": "127.0.0.1", "port": port, "username": "u", "command": "true", "password": "p"
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Network(_)));
    }
}
