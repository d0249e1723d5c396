//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, DeepSeek, Ollama, vLLM, Volcengine Ark, and any
//! endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling with argument decoding
//! - Multimodal message parts
//! - Model listing

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine as _;
use cortex_core::error::ProviderError;
use cortex_core::message::{ContentPart, Message, Role, ToolCall};
use cortex_core::provider::*;
use cortex_core::sse::LineBuffer;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::catalog;

/// An OpenAI-compatible LLM provider bound to one model.
pub struct OpenAiCompatProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    organization: Option<String>,
    options: ChatOptions,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            organization: None,
            options: ChatOptions::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(org) = &self.organization {
            req = req.header("OpenAI-Organization", org);
        }
        req
    }

    fn build_body(&self, messages: &[Message], tools: &[ToolDefinition], stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": to_api_messages(messages),
            "temperature": self.options.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = self.options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(tools));
        }

        if !self.options.stop.is_empty() {
            body["stop"] = serde_json::json!(self.options.stop);
        }

        body
    }

    /// Map a non-success HTTP response to a provider error.
    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match status {
            429 => ProviderError::RateLimited { message: body },
            401 | 403 => ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ),
            _ if crate::retry::is_rate_limit(&body) => ProviderError::RateLimited { message: body },
            _ => {
                warn!(status, body = %body, "Provider returned error");
                ProviderError::ApiError {
                    status_code: status,
                    message: body,
                }
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(messages, tools, false);

        debug!(provider = %self.name, model = %self.model, tools = tools.len(), "Sending completion request");

        let response = self
            .request(&self.completions_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let api_response: ApiResponse = response.json().await.map_err(|e| ProviderError::ApiError {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or(ProviderError::NoResponse)?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments = decode_arguments(&tc.function.name, &tc.function.arguments);
                ToolCall::new(tc.id, tc.function.name, arguments)
            })
            .collect();

        let content = match choice.message.content {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        Ok(ChatResponse {
            message: Message::assistant_with_tool_calls(content, tool_calls),
            usage: api_response.usage.map(Usage::from),
            model: api_response.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    async fn chat_with_tools_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<StreamReceiver, ProviderError> {
        let body = self.build_body(messages, tools, true);

        debug!(provider = %self.name, model = %self.model, "Sending streaming request");

        let response = self
            .request(&self.completions_url())
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = LineBuffer::new();
            let mut parser = StreamAssembler::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                error: ProviderError::StreamInterrupted(e.to_string()).to_string(),
                            })
                            .await;
                        return;
                    }
                };

                buffer.push(&bytes);
                while let Some(line) = buffer.next_line() {
                    match handle_sse_line(&line, &mut parser, &tx, &provider_name).await {
                        LineOutcome::Continue => {}
                        LineOutcome::Done => {
                            parser.finish(&tx).await;
                            return;
                        }
                        LineOutcome::Closed => return,
                    }
                }
            }

            if let Some(line) = buffer.take_rest()
                && matches!(
                    handle_sse_line(&line, &mut parser, &tx, &provider_name).await,
                    LineOutcome::Closed
                )
            {
                return;
            }

            // Stream ended without [DONE]
            parser.finish(&tx).await;
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        catalog::fetch_models(&self.client, &self.base_url, &self.name, self.api_key.as_deref()).await
    }
}

enum LineOutcome {
    Continue,
    Done,
    Closed,
}

/// Feed one SSE line to the assembler, forwarding any content chunk.
async fn handle_sse_line(
    line: &str,
    parser: &mut StreamAssembler,
    tx: &mpsc::Sender<StreamEvent>,
    provider_name: &str,
) -> LineOutcome {
    let Some(data) = line.strip_prefix("data:") else {
        return LineOutcome::Continue;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return LineOutcome::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => {
            if let Some(content) = parser.push(resp)
                && tx.send(StreamEvent::Chunk { content }).await.is_err()
            {
                return LineOutcome::Closed; // receiver dropped
            }
        }
        Err(e) => {
            trace!(provider = %provider_name, data = %data, error = %e, "Ignoring unparseable SSE chunk");
        }
    }
    LineOutcome::Continue
}

/// Decode a provider's JSON-string arguments. Failure yields an empty map.
pub fn decode_arguments(tool_name: &str, raw: &str) -> serde_json::Map<String, serde_json::Value> {
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            warn!(tool = tool_name, "Tool arguments are not a JSON object: {other}");
            serde_json::Map::new()
        }
        Err(e) => {
            warn!(tool = tool_name, error = %e, "Failed to decode tool arguments");
            serde_json::Map::new()
        }
    }
}

/// Convert our messages to the chat-completions wire format.
fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: m.role.as_str().to_string(),
            content: Some(api_content(m)),
            name: m.name.clone(),
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.function.name.clone(),
                                arguments: serde_json::Value::Object(tc.function.arguments.clone())
                                    .to_string(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: if m.role == Role::Tool {
                m.tool_call_id.clone()
            } else {
                None
            },
        })
        .collect()
}

/// Content is never null: plain text becomes a string (possibly empty),
/// multimodal parts become a part array.
fn api_content(m: &Message) -> serde_json::Value {
    if m.parts.is_empty() || m.role == Role::Tool {
        return serde_json::Value::String(m.content.clone());
    }
    let parts: Vec<serde_json::Value> = m
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => serde_json::json!({ "type": "text", "text": text }),
            ContentPart::ImageUrl { url, detail } => {
                let mut image = serde_json::json!({ "url": url });
                if let Some(d) = detail {
                    image["detail"] = serde_json::json!(d);
                }
                serde_json::json!({ "type": "image_url", "image_url": image })
            }
            ContentPart::Binary { mime_type, data } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{mime_type};base64,{encoded}") }
                })
            }
        })
        .collect();
    serde_json::Value::Array(parts)
}

/// Convert tool definitions to OpenAI API format.
fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Folds SSE deltas into content chunks, aggregated tool calls and usage.
#[derive(Default)]
struct StreamAssembler {
    /// Keyed by the delta index so provider order is preserved
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    usage: Option<Usage>,
    saw_choice: bool,
}

impl StreamAssembler {
    /// Absorb one chunk; returns a content delta to forward, if any.
    fn push(&mut self, resp: StreamResponse) -> Option<String> {
        if let Some(usage) = resp.usage {
            self.usage = Some(usage.into());
        }
        let choice = resp.choices.into_iter().next()?;
        self.saw_choice = true;
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let acc = self.tool_calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                acc.id = id;
            }
            if let Some(func) = delta.function {
                if let Some(name) = func.name {
                    acc.name = name;
                }
                if let Some(args) = func.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }
        choice.delta.content.filter(|c| !c.is_empty())
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls.values().map(ToolCallAccumulator::to_tool_call).collect()
    }

    async fn finish(&self, tx: &mpsc::Sender<StreamEvent>) {
        if !self.saw_choice {
            let _ = tx
                .send(StreamEvent::Error {
                    error: ProviderError::NoResponse.to_string(),
                })
                .await;
            return;
        }
        let calls = self.tool_calls();
        if !calls.is_empty() {
            let _ = tx.send(StreamEvent::ToolCalls { tool_calls: calls }).await;
        }
        let _ = tx.send(StreamEvent::End { usage: self.usage }).await;
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn to_tool_call(&self) -> ToolCall {
        ToolCall::new(
            self.id.clone(),
            self.name.clone(),
            decode_arguments(&self.name, &self.arguments),
        )
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta — arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: &str) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new("openai", base, Some("sk-test".into()), "gpt-4o-mini")
    }

    #[test]
    fn message_conversion_roles() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api = to_api_messages(&messages);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
    }

    #[test]
    fn assistant_tool_call_keeps_empty_text() {
        let mut args = serde_json::Map::new();
        args.insert("command".into(), serde_json::json!("ls"));
        let msg = Message::assistant_with_tool_calls("", vec![ToolCall::new("call_1", "command", args)]);
        let json = serde_json::to_value(to_api_messages(&[msg])).unwrap();
        assert_eq!(json[0]["content"], serde_json::json!(""));
        assert_eq!(json[0]["tool_calls"][0]["function"]["arguments"], r#"{"command":"ls"}"#);
    }

    #[test]
    fn tool_response_content_never_null() {
        let msg = Message::tool_result("call_1", "");
        let json = serde_json::to_value(to_api_messages(&[msg])).unwrap();
        assert_eq!(json[0]["role"], "tool");
        assert_eq!(json[0]["tool_call_id"], "call_1");
        assert_eq!(json[0]["content"], serde_json::json!(""));
    }

    #[test]
    fn multimodal_parts() {
        let mut msg = Message::user("");
        msg.parts = vec![
            ContentPart::Text { text: "what is this".into() },
            ContentPart::ImageUrl {
                url: "https://example.com/cat.png".into(),
                detail: Some("high".into()),
            },
            ContentPart::Binary {
                mime_type: "image/png".into(),
                data: vec![1, 2, 3],
            },
        ];
        let content = api_content(&msg);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["detail"], "high");
        assert_eq!(content[2]["image_url"]["url"], "data:image/png;base64,AQID");
    }

    #[test]
    fn bad_arguments_decode_to_empty_map() {
        assert!(decode_arguments("x", "{not json").is_empty());
        assert!(decode_arguments("x", "[1,2]").is_empty());
        assert!(decode_arguments("x", "").is_empty());
        assert_eq!(decode_arguments("x", r#"{"a":1}"#)["a"], 1);
    }

    #[test]
    fn assembler_orders_tool_calls_by_index() {
        let mut asm = StreamAssembler::default();
        let chunks = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"calc","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"get_time","arguments":"{\"timezone\""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"UTC\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
        ];
        let mut content = String::new();
        for c in chunks {
            if let Some(text) = asm.push(serde_json::from_str(c).unwrap()) {
                content.push_str(&text);
            }
        }
        assert_eq!(content, "Hi");
        let calls = asm.tool_calls();
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.arguments["timezone"], "UTC");
        assert_eq!(calls[1].name(), "calc");
    }

    #[tokio::test]
    async fn completion_decodes_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "get_time", "arguments": "{\"timezone\":\"UTC\"}"}}]
                }}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
            })))
            .mount(&server)
            .await;

        let resp = provider(&server.uri()).chat(&[Message::user("time?")]).await.unwrap();
        assert_eq!(resp.message.content, "");
        assert_eq!(resp.message.tool_calls[0].function.arguments["timezone"], "UTC");
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
    }

    #[tokio::test]
    async fn zero_choices_is_no_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoResponse));
    }

    #[tokio::test]
    async fn status_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("retry after 20 ms"))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn streaming_emits_chunks_tool_calls_end() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"get_time\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let mut rx = provider(&server.uri())
            .chat_with_tools_stream(&[Message::user("hi")], &[])
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(events[0], StreamEvent::Chunk { content: "Hel".into() });
        assert_eq!(events[1], StreamEvent::Chunk { content: "lo".into() });
        assert!(matches!(&events[2], StreamEvent::ToolCalls { tool_calls } if tool_calls.len() == 1));
        assert!(matches!(&events[3], StreamEvent::End { usage: Some(u) } if u.total_tokens == 3));
    }

    /// Serves one SSE response, writing the body in two separate pieces.
    async fn split_body_server(first: Vec<u8>, second: Vec<u8>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 8192];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            socket.write_all(&first).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            socket.write_all(&second).await.unwrap();
            socket.flush().await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn streaming_keeps_characters_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\ndata: [DONE]\n\n".as_bytes();
        // Cut after the first byte of '你'
        let cut = body.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let base = split_body_server(body[..cut].to_vec(), body[cut..].to_vec()).await;

        let mut rx = provider(&base)
            .chat_with_tools_stream(&[Message::user("hi")], &[])
            .await
            .unwrap();
        let mut content = String::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Chunk { content: c } = event {
                content.push_str(&c);
            }
        }
        assert_eq!(content, "你好");
    }
}
