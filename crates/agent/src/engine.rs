//! The agent reasoning loop.
//!
//! One turn alternates between an LLM call and a tool phase until the model
//! answers without tool calls or `max_iterations` LLM calls have been made.
//! Tool failures never end the turn; they become tool messages the model can
//! react to. Everything else (LLM failure, memory I/O, cancellation) does.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cortex_config::AgentSettings;
use cortex_core::error::{Error, ProviderError, ToolError};
use cortex_core::memory::MemoryProvider;
use cortex_core::message::{Message, ToolCall};
use cortex_core::provider::{ChatResponse, LlmProvider, StreamEvent, StreamReceiver, ToolDefinition, Usage};
use cortex_core::tool::ToolSet;
use cortex_providers::RateLimiter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ToolCache, cache_key};
use crate::events::{AgentEvent, AgentResult, ToolCallTrace};

/// Per-engine knobs, taken from `[agent]`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
    /// Limit of the rate-limiter wait and the idle limit between two stream
    /// events. The provider applies it to each request attempt, so 429
    /// back-off does not count against it.
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub enable_tool_retry: bool,
    pub enable_memory_compress: bool,
    pub memory_compress_threshold: usize,
    pub memory_compress_ratio: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for EngineConfig {
    fn from(s: &AgentSettings) -> Self {
        Self {
            max_iterations: s.max_iterations.max(1),
            llm_timeout: Duration::from_secs(s.timeout_secs),
            tool_timeout: Duration::from_secs(s.tool_execution_timeout_secs),
            retry_attempts: s.retry_attempts,
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            enable_tool_retry: s.enable_tool_retry,
            enable_memory_compress: s.enable_memory_compress,
            memory_compress_threshold: s.memory_compress_threshold,
            memory_compress_ratio: s.memory_compress_ratio,
        }
    }
}

impl EngineConfig {
    /// Window size compression shrinks the history to.
    pub fn compress_target(&self) -> usize {
        ((self.memory_compress_threshold as f32 * self.memory_compress_ratio) as usize).max(1)
    }
}

/// Clears the running flag when a turn ends, however it ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn cancelled() -> Error {
    Error::Cancelled("request cancelled".into())
}

fn provider_error(e: ProviderError) -> Error {
    match e {
        ProviderError::Cancelled => cancelled(),
        other => Error::Provider(other),
    }
}

/// Strings pass through, everything else is JSON-encoded.
fn render_output(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cut to at most `max` bytes on a character boundary.
fn truncate_bytes(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Next stream event, or `None` when `limit` passed first.
async fn recv_within(rx: &mut StreamReceiver, limit: Option<Duration>) -> Option<Option<StreamEvent>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, rx.recv()).await.ok(),
        None => Some(rx.recv().await),
    }
}

/// Result of the tool phase of one iteration.
struct ToolPhase {
    messages: Vec<Message>,
    traces: Vec<ToolCallTrace>,
}

/// The reasoning loop bound to one provider, tool set and session memory.
pub struct AgentEngine {
    llm: Arc<dyn LlmProvider>,
    tools: ToolSet,
    memory: Arc<dyn MemoryProvider>,
    system_prompt: Option<String>,
    config: EngineConfig,
    limiter: Arc<RateLimiter>,
    cache: ToolCache,
    running: AtomicBool,
}

impl AgentEngine {
    pub fn new(llm: Arc<dyn LlmProvider>, memory: Arc<dyn MemoryProvider>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            llm,
            tools: ToolSet::new(),
            memory,
            system_prompt: None,
            config: EngineConfig::default(),
            limiter,
            cache: ToolCache::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.is_empty()).then_some(prompt);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn session_id(&self) -> &str {
        self.memory.session_id()
    }

    fn try_start(&self) -> Result<(), Error> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::AgentBusy)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// System prompt, session history, caller-supplied context, then the input.
    async fn initial_messages(&self, input: &str, prior: &[Message]) -> Result<Vec<Message>, Error> {
        let history = self.memory.load_memory_variables().await?.history;
        let mut messages = Vec::with_capacity(history.len() + prior.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(history);
        messages.extend_from_slice(prior);
        messages.push(Message::user(input));
        Ok(messages)
    }

    async fn call_llm(
        &self,
        messages: &[Message],
        definitions: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, Error> {
        let deadline = Instant::now() + self.config.llm_timeout;
        self.limiter
            .wait(cancel, Some(deadline))
            .await
            .map_err(provider_error)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            res = self.llm.chat_with_tools(messages, definitions) => res.map_err(provider_error),
        }
    }

    /// Run one tool, retrying retryable failures when enabled.
    async fn invoke_tool(
        &self,
        name: &str,
        tool: &Arc<dyn cortex_core::tool::Tool>,
        args: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<Result<serde_json::Value, ToolError>, Error> {
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                res = tokio::time::timeout(self.config.tool_timeout, tool.execute(args.clone())) => match res {
                    Ok(r) => r,
                    Err(_) => Err(ToolError::Timeout {
                        tool_name: name.to_string(),
                        timeout_secs: self.config.tool_timeout.as_secs(),
                    }),
                },
            };
            match outcome {
                Err(e) if self.config.enable_tool_retry && e.is_retryable() && attempt < self.config.retry_attempts => {
                    attempt += 1;
                    debug!(tool = %name, attempt, error = %e, "Retrying tool");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(cancelled()),
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Execute tool calls sequentially in provider order.
    async fn run_tool_calls(&self, calls: &[ToolCall], cancel: &CancellationToken) -> Result<ToolPhase, Error> {
        let mut phase = ToolPhase {
            messages: Vec::with_capacity(calls.len()),
            traces: Vec::with_capacity(calls.len()),
        };

        for call in calls {
            let name = call.name();
            let args = call.arguments_value();
            let started = Instant::now();
            let mut trace = ToolCallTrace {
                id: call.id.clone(),
                name: name.to_string(),
                args: args.clone(),
                result: None,
                error: None,
                cached: false,
                duration_ms: 0,
            };

            let Some(tool) = self.tools.get(name) else {
                warn!(tool = %name, "Model requested an unknown tool");
                let content = format!("Tool {name} not found");
                trace.error = Some(content.clone());
                phase.messages.push(Message::tool_result(&call.id, content));
                phase.traces.push(trace);
                continue;
            };
            let max_len = tool.metadata().max_truncation_length;

            let key = cache_key(name, &args);
            let content = if let Some(hit) = self.cache.get(&key) {
                debug!(tool = %name, "Tool cache hit");
                trace.cached = true;
                let content = render_output(&hit);
                trace.result = Some(hit);
                content
            } else {
                match self.invoke_tool(name, &tool, &args, cancel).await? {
                    Ok(value) => {
                        let content = render_output(&value);
                        self.cache.put(key, value.clone());
                        trace.result = Some(value);
                        content
                    }
                    Err(e) => {
                        warn!(tool = %name, error = %e, "Tool execution failed");
                        trace.error = Some(e.to_string());
                        format!("Error: {e}")
                    }
                }
            };

            trace.duration_ms = started.elapsed().as_millis() as u64;
            phase
                .messages
                .push(Message::tool_result(&call.id, truncate_bytes(content, max_len)));
            phase.traces.push(trace);
        }

        Ok(phase)
    }

    /// Save the exchange and shrink the history when it grew past the threshold.
    async fn finish_turn(&self, input: &str, output: &str) -> Result<(), Error> {
        self.memory.save_context(Some(input), Some(output)).await?;
        if !self.config.enable_memory_compress {
            return Ok(());
        }
        let size = match self.memory.get_chat_history().await {
            Ok(history) => history.len(),
            Err(e) => {
                warn!(session_id = %self.memory.session_id(), error = %e, "History read for compression failed");
                return Ok(());
            }
        };
        if size > self.config.memory_compress_threshold {
            let target = self.config.compress_target();
            match self.memory.compress_memory(self.llm.as_ref(), target).await {
                Ok(changed) => debug!(session_id = %self.memory.session_id(), size, target, changed, "Memory compression"),
                Err(e) => warn!(session_id = %self.memory.session_id(), error = %e, "Memory compression failed"),
            }
        }
        Ok(())
    }

    /// Run one blocking turn.
    ///
    /// `prior` is inserted between the stored history and the input.
    pub async fn execute(
        &self,
        input: &str,
        prior: &[Message],
        cancel: &CancellationToken,
    ) -> Result<AgentResult, Error> {
        self.try_start()?;
        let _running = Running(&self.running);
        let session_id = self.memory.session_id();
        info!(
            session_id = %session_id,
            provider = %self.llm.name(),
            model = %self.llm.model(),
            tools = self.tools.len(),
            "Executing agent turn"
        );

        let mut messages = self.initial_messages(input, prior).await?;
        let definitions = self.tools.definitions();
        let mut result = AgentResult::default();
        let mut last_content = String::new();

        while result.iterations < self.config.max_iterations {
            result.iterations += 1;
            debug!(session_id = %session_id, iteration = result.iterations, "Agent loop iteration");

            let response = self.call_llm(&messages, &definitions, cancel).await?;
            if let Some(usage) = &response.usage {
                result.usage.get_or_insert_with(Usage::default).add(usage);
            }
            let assistant = response.message;
            last_content = assistant.content.clone();
            messages.push(assistant.clone());
            result.transcript.push(assistant.clone());

            if !assistant.has_tool_calls() {
                result.output = last_content;
                self.finish_turn(input, &result.output).await?;
                info!(session_id = %session_id, iterations = result.iterations, tool_calls = result.tool_calls.len(), "Agent turn complete");
                return Ok(result);
            }

            debug!(session_id = %session_id, count = assistant.tool_calls.len(), "Executing tool calls");
            let phase = self.run_tool_calls(&assistant.tool_calls, cancel).await?;
            messages.extend(phase.messages.iter().cloned());
            result.transcript.extend(phase.messages);
            result.tool_calls.extend(phase.traces);
        }

        warn!(session_id = %session_id, max = self.config.max_iterations, "Max iterations reached");
        result.iterations = self.config.max_iterations;
        result.output = last_content;
        self.finish_turn(input, &result.output).await?;
        Ok(result)
    }

    /// Run one turn, streaming events.
    ///
    /// Fails up front with `AgentBusy`; every later failure arrives as one
    /// terminal `error` event. Dropping the receiver stops the turn.
    pub fn execute_stream(
        self: Arc<Self>,
        input: String,
        prior: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>, Error> {
        self.try_start()?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _running = Running(&self.running);
            let outcome = self.stream_turn(&input, &prior, &cancel, &tx).await;
            let terminal = match outcome {
                Ok(Some(result)) => AgentEvent::End { data: result },
                Ok(None) => return,
                Err(Error::Cancelled(reason)) => {
                    info!(session_id = %self.memory.session_id(), "Streaming turn cancelled");
                    AgentEvent::Error {
                        error: format!("cancelled: {reason}"),
                    }
                }
                Err(Error::Provider(ProviderError::Reported(error))) => {
                    warn!(session_id = %self.memory.session_id(), error = %error, "Streaming turn failed");
                    AgentEvent::Error { error }
                }
                Err(e) => {
                    warn!(session_id = %self.memory.session_id(), error = %e, "Streaming turn failed");
                    AgentEvent::Error { error: e.to_string() }
                }
            };
            let _ = tx.send(terminal).await;
        });
        Ok(rx)
    }

    /// `Ok(None)` when the receiver went away.
    async fn stream_turn(
        &self,
        input: &str,
        prior: &[Message],
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Option<AgentResult>, Error> {
        let session_id = self.memory.session_id();
        info!(session_id = %session_id, provider = %self.llm.name(), model = %self.llm.model(), "Streaming agent turn");

        let mut messages = self.initial_messages(input, prior).await?;
        let definitions = self.tools.definitions();
        let mut result = AgentResult::default();
        let mut last_content = String::new();

        while result.iterations < self.config.max_iterations {
            result.iterations += 1;

            let deadline = Instant::now() + self.config.llm_timeout;
            self.limiter
                .wait(cancel, Some(deadline))
                .await
                .map_err(provider_error)?;
            let mut upstream = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                res = tokio::time::timeout_at(deadline, self.llm.chat_with_tools_stream(&messages, &definitions)) => match res {
                    Ok(rx) => rx.map_err(provider_error)?,
                    Err(_) => return Err(Error::Provider(ProviderError::Timeout("stream open timed out".into()))),
                },
            };

            let mut content = String::new();
            let mut calls: Vec<ToolCall> = Vec::new();
            // Set between a back-off notice and the next attempt
            let mut backing_off = false;
            loop {
                let idle_limit = (!backing_off).then_some(self.config.llm_timeout);
                let event = tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled()),
                    ev = recv_within(&mut upstream, idle_limit) => match ev {
                        Some(ev) => ev,
                        None => return Err(Error::Provider(ProviderError::Timeout("stream idle timeout".into()))),
                    },
                };
                backing_off = matches!(event, Some(StreamEvent::Info { .. }));
                let forward = match event {
                    Some(StreamEvent::Chunk { content: delta }) => {
                        content.push_str(&delta);
                        Some(AgentEvent::Chunk { content: delta })
                    }
                    Some(StreamEvent::ToolCalls { tool_calls }) => {
                        calls.extend(tool_calls);
                        None
                    }
                    Some(StreamEvent::Info { message }) => Some(AgentEvent::Info { message }),
                    Some(StreamEvent::Retry { attempt }) => {
                        content.clear();
                        calls.clear();
                        Some(AgentEvent::Info {
                            message: format!("Retrying LLM call (attempt {attempt})"),
                        })
                    }
                    Some(StreamEvent::Error { error }) => {
                        return Err(Error::Provider(ProviderError::Reported(error)));
                    }
                    Some(StreamEvent::End { usage }) => {
                        if let Some(usage) = usage {
                            result.usage.get_or_insert_with(Usage::default).add(&usage);
                        }
                        break;
                    }
                    None => {
                        return Err(Error::Provider(ProviderError::StreamInterrupted(
                            "stream closed before end".into(),
                        )));
                    }
                };
                if let Some(ev) = forward
                    && tx.send(ev).await.is_err()
                {
                    return Ok(None);
                }
            }

            last_content = content.clone();
            if calls.is_empty() {
                let assistant = Message::assistant(content);
                messages.push(assistant.clone());
                result.transcript.push(assistant);
                result.output = last_content;
                self.finish_turn(input, &result.output).await?;
                info!(session_id = %session_id, iterations = result.iterations, "Streaming turn complete");
                return Ok(Some(result));
            }

            if tx
                .send(AgentEvent::ToolCalls {
                    tool_calls: calls.clone(),
                })
                .await
                .is_err()
            {
                return Ok(None);
            }
            let assistant = Message::assistant_with_tool_calls(content, calls);
            messages.push(assistant.clone());
            result.transcript.push(assistant.clone());

            let phase = self.run_tool_calls(&assistant.tool_calls, cancel).await?;
            messages.extend(phase.messages.iter().cloned());
            result.transcript.extend(phase.messages);
            result.tool_calls.extend(phase.traces);
        }

        warn!(session_id = %session_id, max = self.config.max_iterations, "Max iterations reached");
        result.iterations = self.config.max_iterations;
        result.output = last_content;
        self.finish_turn(input, &result.output).await?;
        Ok(Some(result))
    }
}
