//! `net_check` — TCP reachability probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;
use tokio::net::TcpStream;
use tracing::debug;

pub const NAME: &str = "net_check";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT_SECS: u64 = 30;

pub struct NetCheckTool;

#[async_trait]
impl Tool for NetCheckTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Check whether a TCP port on a host is reachable and measure connect latency."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "host": { "type": "string", "description": "Hostname or IP address" },
                "port": { "type": "integer", "minimum": 1, "maximum": 65535 },
                "timeout_secs": { "type": "integer", "description": "Connect timeout (default 5)" }
            },
            "required": ["host", "port"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let host = arguments["host"]
            .as_str()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'host' argument".into()))?;
        let port = arguments["port"]
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or_else(|| ToolError::InvalidArguments("'port' must be in 1..=65535".into()))?;
        let timeout = arguments["timeout_secs"]
            .as_u64()
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s.min(MAX_TIMEOUT_SECS)))
            .unwrap_or(DEFAULT_TIMEOUT);

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, TcpStream::connect((host, port))).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("connect timed out after {}s", timeout.as_secs())),
        };
        debug!(host, port, reachable = error.is_none(), latency_ms, "Net check");

        let mut out = serde_json::json!({
            "host": host,
            "port": port,
            "reachable": error.is_none(),
            "latency_ms": latency_ms,
        });
        if let Some(e) = error {
            out["error"] = serde_json::Value::String(e);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_port_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let out = NetCheckTool
            .execute(serde_json::json!({"host": "127.0.0.1", "port": port}))
            .await
            .unwrap();
        assert_eq!(out["reachable"], true);
        assert!(out.get("error").is_none());
    }

    #[tokio::test]
    async fn closed_port_reports_error() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let out = NetCheckTool
            .execute(serde_json::json!({"host": "127.0.0.1", "port": port, "timeout_secs": 2}))
            .await
            .unwrap();
        assert_eq!(out["reachable"], false);
        assert!(out["error"].is_string());
    }

    #[tokio::test]
    async fn invalid_port() {
        let err = NetCheckTool
            .execute(serde_json::json!({"host": "localhost", "port": 70000}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
