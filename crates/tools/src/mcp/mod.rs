//! Model Context Protocol: client and the adapter exposing remote tools.

pub mod client;
pub mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::McpServerConfig;
use cortex_core::error::ToolError;
use cortex_core::tool::{Tool, ToolMetadata};
use tracing::info;

pub use client::{McpClient, McpToolDescriptor};

/// One remote tool, invoked through its server's client.
pub struct McpTool {
    client: Arc<McpClient>,
    descriptor: McpToolDescriptor,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, descriptor: McpToolDescriptor) -> Self {
        Self { client, descriptor }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.descriptor.input_schema.clone()
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::mcp()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        self.client.call_tool(&self.descriptor.name, arguments).await
    }
}

/// Connect to one server and adapt the tools it lists.
///
/// An empty allow-list admits everything the server offers.
pub async fn load_tools(config: &McpServerConfig, http: reqwest::Client) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
    let client = McpClient::connect(config, http).await?;
    let listed = client.list_tools().await?;
    let total = listed.len();
    let tools: Vec<Arc<dyn Tool>> = listed
        .into_iter()
        .filter(|d| config.tools.is_empty() || config.tools.iter().any(|t| t == &d.name))
        .map(|d| Arc::new(McpTool::new(client.clone(), d)) as Arc<dyn Tool>)
        .collect();
    info!(server = %client.server(), listed = total, bound = tools.len(), "MCP tools loaded");
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc(id: u64, result: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }

    async fn server_with_tools() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(serde_json::json!({
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "clientInfo": { "name": "cortex-mcp-client", "version": "1.0.0" }
                }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "sess-1")
                    .append_header("set-cookie", "route=a; Path=/")
                    .set_body_json(rpc(1, serde_json::json!({"protocolVersion": "2024-11-05", "capabilities": {}}))),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-1"))
            .and(body_partial_json(serde_json::json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-1"))
            .and(header("cookie", "route=a"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(rpc(
                2,
                serde_json::json!({"tools": [
                    {"name": "echo", "description": "Echo text", "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}},
                    {"name": "wipe", "description": "Dangerous"}
                ]}),
            )))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-1"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call", "params": {"name": "echo"}})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"hello\"}]}}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        server
    }

    fn config(url: String, tools: Vec<String>) -> McpServerConfig {
        McpServerConfig {
            name: "mock".into(),
            url,
            transport: None,
            tools,
            headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn handshake_list_and_call_over_streamable_http() {
        let server = server_with_tools().await;
        let tools = load_tools(&config(format!("{}/mcp", server.uri()), vec![]), reqwest::Client::new())
            .await
            .unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["echo", "wipe"]);
        assert_eq!(tools[0].metadata().tool_type, cortex_core::ToolType::Mcp);
        assert_eq!(tools[1].parameters_schema()["type"], "object");

        let out = tools[0].execute(serde_json::json!({"text": "hello"})).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn allow_list_filters_tools() {
        let server = server_with_tools().await;
        let tools = load_tools(
            &config(format!("{}/mcp", server.uri()), vec!["echo".into(), "absent".into()]),
            reqwest::Client::new(),
        )
        .await
        .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "echo");
    }

    #[tokio::test]
    async fn unreachable_server_fails() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let result = load_tools(&config(format!("http://127.0.0.1:{port}/mcp"), vec![]), reqwest::Client::new()).await;
        assert!(result.is_err());
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        use tokio::io::AsyncReadExt;

        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    /// One connection per request; the `tools/call` reply is an SSE body
    /// written in two pieces that cut a character in half.
    async fn split_reply_server() -> String {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    let json = |body: String| {
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        )
                    };
                    if request.contains("\"method\":\"initialize\"") {
                        let body = rpc(1, serde_json::json!({"protocolVersion": "2024-11-05", "capabilities": {}}));
                        socket.write_all(json(body.to_string()).as_bytes()).await.unwrap();
                    } else if request.contains("notifications/initialized") {
                        socket
                            .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                            .await
                            .unwrap();
                    } else if request.contains("tools/list") {
                        let body = rpc(2, serde_json::json!({"tools": [{"name": "weather", "description": "Weather"}]}));
                        socket.write_all(json(body.to_string()).as_bytes()).await.unwrap();
                    } else {
                        let event = format!(
                            "data: {}\n\n",
                            rpc(3, serde_json::json!({"content": [{"type": "text", "text": "天气晴朗 ☀"}]}))
                        );
                        let bytes = event.as_bytes();
                        let cut = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
                        socket
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n")
                            .await
                            .unwrap();
                        socket.write_all(&bytes[..cut]).await.unwrap();
                        socket.flush().await.unwrap();
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        socket.write_all(&bytes[cut..]).await.unwrap();
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/mcp")
    }

    #[tokio::test]
    async fn streamed_call_result_keeps_split_characters() {
        let url = split_reply_server().await;
        let tools = load_tools(&config(url, vec![]), reqwest::Client::new()).await.unwrap();
        assert_eq!(tools[0].name(), "weather");

        let out = tools[0].execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out, "天气晴朗 ☀");
    }
}

