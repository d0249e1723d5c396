//! JSON-RPC 2.0 client for MCP tool servers.
//!
//! Two transports: streamable HTTP (every request is a POST to the endpoint
//! URL; the reply is JSON or a short SSE stream) and the older HTTP+SSE
//! pairing (a long-lived GET stream announces a POST endpoint and carries
//! the replies). The server's `Mcp-Session-Id` header is echoed on every
//! later request and `Set-Cookie` values are replayed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cortex_core::McpServerConfig;
use cortex_core::error::ToolError;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sse::SseDecoder;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "cortex-mcp-client";
pub const CLIENT_VERSION: &str = "1.0.0";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const LIST_TIMEOUT: Duration = Duration::from_secs(60);
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const SESSION_HEADER: &str = "mcp-session-id";

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    cookies: BTreeMap<String, String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum Channel {
    Http,
    Sse {
        endpoint: String,
        pending: Pending,
        reader: JoinHandle<()>,
    },
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Channel::Sse { reader, .. } = self {
            reader.abort();
        }
    }
}

pub struct McpClient {
    server: String,
    url: String,
    http: reqwest::Client,
    headers: HashMap<String, String>,
    state: Mutex<SessionState>,
    channel: Channel,
    next_id: AtomicU64,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.server)
            .field("url", &self.url)
            .field("sse", &matches!(self.channel, Channel::Sse { .. }))
            .finish()
    }
}

fn not_connected(server: &str, reason: impl std::fmt::Display) -> ToolError {
    ToolError::McpNotConnected(format!("{server}: {reason}"))
}

/// Keep `name=value` of each `Set-Cookie` header.
fn absorb_cookies(headers: &reqwest::header::HeaderMap, jar: &mut BTreeMap<String, String>) {
    for value in headers.get_all(reqwest::header::SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        let pair = raw.split(';').next().unwrap_or("");
        if let Some((name, val)) = pair.split_once('=') {
            jar.insert(name.trim().to_string(), val.trim().to_string());
        }
    }
}

/// Unwrap a JSON-RPC response into its `result`.
fn rpc_result(server: &str, method: &str, response: serde_json::Value) -> Result<serde_json::Value, ToolError> {
    if let Some(err) = response.get("error") {
        return Err(ToolError::ExecutionFailed {
            tool_name: format!("mcp:{server}"),
            reason: format!(
                "{method}: error {}: {}",
                err["code"],
                err["message"].as_str().unwrap_or("unknown")
            ),
        });
    }
    Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

impl McpClient {
    /// Connect and complete the `initialize` handshake.
    ///
    /// Without an explicit `sse` transport the streamable HTTP transport is
    /// tried first and SSE is the fallback.
    pub async fn connect(config: &McpServerConfig, http: reqwest::Client) -> Result<Arc<Self>, ToolError> {
        let server = if config.name.is_empty() {
            config.url.clone()
        } else {
            config.name.clone()
        };
        let sse_only = config
            .transport
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("sse"));

        if !sse_only {
            let client = Self {
                server: server.clone(),
                url: config.url.clone(),
                http: http.clone(),
                headers: config.headers.clone(),
                state: Mutex::new(SessionState::default()),
                channel: Channel::Http,
                next_id: AtomicU64::new(1),
            };
            match client.initialize().await {
                Ok(()) => return Ok(Arc::new(client)),
                Err(http_err) => {
                    debug!(server = %server, error = %http_err, "Streamable HTTP failed, trying SSE");
                    return match Self::connect_sse(&server, config, http).await {
                        Ok(client) => Ok(client),
                        Err(sse_err) => {
                            debug!(server = %server, error = %sse_err, "SSE fallback failed");
                            Err(http_err)
                        }
                    };
                }
            }
        }
        Self::connect_sse(&server, config, http).await
    }

    async fn connect_sse(server: &str, config: &McpServerConfig, http: reqwest::Client) -> Result<Arc<Self>, ToolError> {
        let mut request = http
            .get(&config.url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (k, v) in &config.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| not_connected(server, e))?;
        if !response.status().is_success() {
            return Err(not_connected(server, format!("SSE handshake status {}", response.status())));
        }

        let mut state = SessionState::default();
        absorb_cookies(response.headers(), &mut state.cookies);
        if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            state.session_id = Some(id.to_string());
        }
        let base = response.url().clone();

        let pending: Pending = Arc::default();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let reader = tokio::spawn(read_sse_stream(
            server.to_string(),
            response,
            pending.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(CONNECT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            _ => {
                reader.abort();
                return Err(not_connected(server, "no endpoint event on SSE stream"));
            }
        };
        let endpoint = base
            .join(&endpoint)
            .map_err(|e| not_connected(server, format!("bad endpoint '{endpoint}': {e}")))?
            .to_string();
        debug!(server = %server, endpoint = %endpoint, "SSE endpoint announced");

        let client = Self {
            server: server.to_string(),
            url: config.url.clone(),
            http,
            headers: config.headers.clone(),
            state: Mutex::new(state),
            channel: Channel::Sse {
                endpoint,
                pending,
                reader,
            },
            next_id: AtomicU64::new(1),
        };
        client.initialize().await?;
        Ok(Arc::new(client))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.session_id.clone())
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
        });
        let result = self.request("initialize", params, CONNECT_TIMEOUT).await?;
        debug!(
            server = %self.server,
            protocol = %result["protocolVersion"],
            session = ?self.session_id(),
            "MCP initialized"
        );
        self.notify("notifications/initialized").await
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDescriptor>, ToolError> {
        let result = self
            .request("tools/list", serde_json::json!({}), LIST_TIMEOUT)
            .await?;
        let tools = result.get("tools").cloned().unwrap_or(serde_json::json!([]));
        serde_json::from_value(tools).map_err(|e| ToolError::ExecutionFailed {
            tool_name: format!("mcp:{}", self.server),
            reason: format!("malformed tools/list result: {e}"),
        })
    }

    /// Invoke a remote tool and map its content to a JSON value.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let arguments = match arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        let result = self
            .request(
                "tools/call",
                serde_json::json!({ "name": name, "arguments": arguments }),
                CALL_TIMEOUT,
            )
            .await
            .map_err(|e| match e {
                ToolError::Timeout { timeout_secs, .. } => ToolError::Timeout {
                    tool_name: name.to_string(),
                    timeout_secs,
                },
                other => other,
            })?;
        call_result(name, result)
    }

    fn post(&self, url: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        if let Ok(state) = self.state.lock() {
            if let Some(id) = &state.session_id {
                request = request.header(SESSION_HEADER, id.as_str());
            }
            if !state.cookies.is_empty() {
                let cookie = state
                    .cookies
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                request = request.header(reqwest::header::COOKIE, cookie);
            }
        }
        request
    }

    async fn send(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response, ToolError> {
        let response = self
            .post(url, body)
            .send()
            .await
            .map_err(|e| ToolError::Network(format!("{}: {e}", self.server)))?;

        if let Ok(mut state) = self.state.lock() {
            if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
                state.session_id = Some(id.to_string());
            }
            absorb_cookies(response.headers(), &mut state.cookies);
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(not_connected(&self.server, format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }

    async fn notify(&self, method: &str) -> Result<(), ToolError> {
        let body = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        let url = match &self.channel {
            Channel::Http => self.url.as_str(),
            Channel::Sse { endpoint, .. } => endpoint.as_str(),
        };
        self.send(url, &body).await.map(|_| ())
    }

    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        debug!(server = %self.server, method, id, "MCP request");

        let exchange = async {
            let response = match &self.channel {
                Channel::Http => {
                    let response = self.send(&self.url, &body).await?;
                    self.read_http_reply(id, response).await?
                }
                Channel::Sse { endpoint, pending, .. } => {
                    let (tx, rx) = oneshot::channel();
                    if let Ok(mut map) = pending.lock() {
                        map.insert(id, tx);
                    }
                    if let Err(e) = self.send(endpoint, &body).await {
                        if let Ok(mut map) = pending.lock() {
                            map.remove(&id);
                        }
                        return Err(e);
                    }
                    rx.await
                        .map_err(|_| not_connected(&self.server, "SSE stream closed"))?
                }
            };
            rpc_result(&self.server, method, response)
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                if let Channel::Sse { pending, .. } = &self.channel
                    && let Ok(mut map) = pending.lock()
                {
                    map.remove(&id);
                }
                warn!(server = %self.server, method, "MCP request timed out");
                Err(ToolError::Timeout {
                    tool_name: format!("mcp:{}", self.server),
                    timeout_secs: deadline.as_secs(),
                })
            }
        }
    }

    /// A streamable HTTP reply is either one JSON object or an SSE stream
    /// that eventually carries the response with our id.
    async fn read_http_reply(&self, id: u64, response: reqwest::Response) -> Result<serde_json::Value, ToolError> {
        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let malformed = |e: &dyn std::fmt::Display| ToolError::ExecutionFailed {
            tool_name: format!("mcp:{}", self.server),
            reason: format!("malformed response: {e}"),
        };

        if !is_stream {
            return response.json().await.map_err(|e| malformed(&e));
        }

        let mut decoder = SseDecoder::default();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ToolError::Network(format!("{}: {e}", self.server)))?;
            for event in decoder.push(&chunk) {
                if let Some(reply) = matching_reply(id, &event.data) {
                    return Ok(reply);
                }
            }
        }
        if let Some(event) = decoder.finish()
            && let Some(reply) = matching_reply(id, &event.data)
        {
            return Ok(reply);
        }
        Err(malformed(&"stream ended without a response"))
    }
}

fn matching_reply(id: u64, data: &str) -> Option<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    (value.get("id").and_then(|v| v.as_u64()) == Some(id)).then_some(value)
}

/// Drives a legacy SSE stream: the first `endpoint` event names the POST
/// URL, later `message` events are routed to waiting requests by id.
async fn read_sse_stream(
    server: String,
    response: reqwest::Response,
    pending: Pending,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::default();
    let mut bytes = response.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        let Ok(chunk) = chunk else { break };
        for event in decoder.push(&chunk) {
            if event.event == "endpoint" {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(event.data.trim().to_string());
                }
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                continue;
            };
            let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                continue;
            };
            let waiter = pending.lock().ok().and_then(|mut map| map.remove(&id));
            if let Some(tx) = waiter {
                let _ = tx.send(value);
            }
        }
    }
    debug!(server = %server, "MCP SSE stream closed");
    // Fail whoever is still waiting.
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
}

/// Structured content wins, then joined text parts, then the raw content.
fn call_result(name: &str, result: serde_json::Value) -> Result<serde_json::Value, ToolError> {
    let content = result["content"].as_array().cloned().unwrap_or_default();
    let text: Vec<&str> = content
        .iter()
        .filter(|c| c["type"] == "text")
        .filter_map(|c| c["text"].as_str())
        .collect();

    if result["isError"].as_bool().unwrap_or(false) {
        let reason = if text.is_empty() {
            "MCP tool returned an error result".to_string()
        } else {
            text.join("\n")
        };
        return Err(ToolError::ExecutionFailed {
            tool_name: name.to_string(),
            reason,
        });
    }

    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    if !text.is_empty() {
        return Ok(serde_json::Value::String(text.join("\n")));
    }
    Ok(serde_json::Value::Array(content))
}
