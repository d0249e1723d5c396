//! Chat orchestration: session resolution, engine assembly and persistence.
//!
//! Each request gets a freshly assembled [`AgentEngine`] bound to the
//! session's memory, the role's composed system prompt and its bound tools.
//! The orchestrator also answers `notify_role` by running a one-message turn
//! against the target role in a new session.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cortex_config::{AgentSettings, AppConfig, ChatLlmSetting, NotifyConfig};
use cortex_core::error::{Error, ProviderError};
use cortex_core::message::Role;
use cortex_core::provider::{ChatOptions, LlmProvider};
use cortex_core::store::{ChatStore, ExperienceStore, RoleStore};
use cortex_core::{AgentRole, ChatMessage, RoleNotifier, Session, ToolConfig};
use cortex_db::CachedSettings;
use cortex_memory::MemoryFactory;
use cortex_providers::{ProviderFactory, RateLimiter};
use cortex_tools::BuiltinOptions;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binder::ToolBinder;
use crate::engine::{AgentEngine, EngineConfig};
use crate::events::{AgentEvent, AgentResult};
use crate::prompt::compose_system_prompt;

/// Settings group holding named system prompts for the free-form endpoint.
pub const SETTINGS_GROUP_PROMPT: &str = "prompt";

/// Role id recorded on sessions of the free-form endpoint.
pub const AD_HOC_ROLE_ID: &str = "agent";

/// Builds LLM providers. [`ProviderFactory`] is the production source.
#[async_trait]
pub trait ProviderSource: Send + Sync {
    fn build(&self, setting: &ChatLlmSetting, provider: &str, model: &str, options: ChatOptions) -> Arc<dyn LlmProvider>;

    async fn list_models(&self, setting: &ChatLlmSetting, provider: &str) -> Result<Vec<String>, ProviderError>;
}

#[async_trait]
impl ProviderSource for ProviderFactory {
    fn build(&self, setting: &ChatLlmSetting, provider: &str, model: &str, options: ChatOptions) -> Arc<dyn LlmProvider> {
        ProviderFactory::build(self, setting, provider, model, options)
    }

    async fn list_models(&self, setting: &ChatLlmSetting, provider: &str) -> Result<Vec<String>, ProviderError> {
        ProviderFactory::list_models(self, setting, provider).await
    }
}

/// The persistence handles the orchestrator works against.
#[derive(Clone)]
pub struct Stores {
    pub chats: Arc<dyn ChatStore>,
    pub roles: Arc<dyn RoleStore>,
    pub experiences: Arc<dyn ExperienceStore>,
    pub settings: Arc<CachedSettings>,
}

/// Process-wide knobs taken from the file configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub agent: AgentSettings,
    pub notify: NotifyConfig,
    pub builtin: BuiltinOptions,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            agent: config.agent.clone(),
            notify: config.notify.clone(),
            builtin: BuiltinOptions {
                command_timeout: std::time::Duration::from_secs(config.tools.command_timeout_secs),
                file_root: config.tools.file_root.clone(),
            },
        }
    }
}

/// One message of a chat request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInput {
    pub role: Role,
    pub content: String,
}

/// Body of the role chat endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatInput>,
}

impl ChatRequest {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatInput {
                role: Role::User,
                content: text.into(),
            }],
        }
    }

    /// The latest user message, which is the input of the turn.
    pub fn user_input(&self) -> Result<&str, Error> {
        self.split_input().map(|(_, input)| input)
    }

    fn split_input(&self) -> Result<(usize, &str), Error> {
        self.messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .map(|idx| (idx, self.messages[idx].content.as_str()))
            .ok_or_else(|| Error::BadRequest("at least one user message is required".into()))
    }
}

/// Body of the free-form endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Literal system prompt
    #[serde(default)]
    pub prompt_content: Option<String>,
    /// `{principle?, toolConfig?}` applied to the ad-hoc role
    #[serde(default)]
    pub prompt_config: Option<serde_json::Value>,
    /// Name of a stored prompt in the `prompt` settings group
    #[serde(default)]
    pub prompt_key: Option<String>,
    /// Use a stored role instead of an ad-hoc one
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptConfig {
    #[serde(default)]
    principle: Option<String>,
    #[serde(default)]
    tool_config: Option<ToolConfig>,
}

/// Result of a blocking turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    /// Everything persisted by this turn, in order
    pub messages: Vec<ChatMessage>,
    #[serde(skip)]
    pub result: AgentResult,
}

/// An engine ready to stream one turn.
pub struct PreparedStream {
    pub session_id: String,
    engine: Arc<AgentEngine>,
    input: String,
    chats: Arc<dyn ChatStore>,
    experience_ids: Vec<String>,
}

impl PreparedStream {
    pub fn engine(&self) -> &Arc<AgentEngine> {
        &self.engine
    }

    /// Start the turn. The transcript is persisted when the `end` event passes.
    pub fn start(self, cancel: CancellationToken) -> Result<mpsc::Receiver<AgentEvent>, Error> {
        let mut upstream = self.engine.clone().execute_stream(self.input.clone(), Vec::new(), cancel)?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(event) = upstream.recv().await {
                if let AgentEvent::End { data } = &event {
                    let records = transcript_records(&self.session_id, data, &self.experience_ids);
                    if let Err(e) = self.chats.insert_messages(&records).await {
                        warn!(session_id = %self.session_id, error = %e, "Persisting streamed turn failed");
                    }
                }
                if tx.send(event).await.is_err() {
                    debug!(session_id = %self.session_id, "Stream receiver dropped");
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Chat records for what the engine appended after the user input.
///
/// Intermediate assistant messages keep their tool calls in `meta`, tool
/// messages their call id. The final assistant record carries the turn trace.
pub fn transcript_records(session_id: &str, result: &AgentResult, experience_ids: &[String]) -> Vec<ChatMessage> {
    let mut final_meta = result.meta();
    final_meta["experienceIds"] = serde_json::json!(experience_ids);

    let last_plain = result
        .transcript
        .last()
        .is_some_and(|m| m.role == Role::Assistant && !m.has_tool_calls());
    let count = result.transcript.len();

    let mut records: Vec<ChatMessage> = result
        .transcript
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let record = ChatMessage::new(session_id, m.role, m.content.clone());
            if last_plain && i + 1 == count {
                record.with_meta(final_meta.clone())
            } else if m.has_tool_calls() {
                record.with_meta(serde_json::json!({ "toolCalls": m.tool_calls }))
            } else if let Some(id) = &m.tool_call_id {
                record.with_meta(serde_json::json!({ "toolCallId": id }))
            } else {
                record
            }
        })
        .collect();

    if !last_plain {
        records.push(ChatMessage::new(session_id, Role::Assistant, result.output.clone()).with_meta(final_meta));
    }
    records
}

struct Assembled {
    session: Session,
    engine: Arc<AgentEngine>,
    experience_ids: Vec<String>,
}

pub struct ChatOrchestrator {
    me: Weak<ChatOrchestrator>,
    stores: Stores,
    providers: Arc<dyn ProviderSource>,
    limiter: Arc<RateLimiter>,
    binder: ToolBinder,
    settings: OrchestratorSettings,
    /// Connected memory backend, keyed by the setting it was built from
    memory: Mutex<Option<(String, MemoryFactory)>>,
}

impl ChatOrchestrator {
    pub fn new(
        stores: Stores,
        providers: Arc<dyn ProviderSource>,
        limiter: Arc<RateLimiter>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            binder: ToolBinder::new(settings.builtin.clone(), stores.experiences.clone()),
            stores,
            providers,
            limiter,
            settings,
            memory: Mutex::new(None),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// The memory backend for the setting in effect, reconnected when it changed.
    async fn memory_factory(&self) -> Result<MemoryFactory, Error> {
        let setting = self.stores.settings.memory().await;
        let key = serde_json::to_string(&setting)?;
        let mut slot = self.memory.lock().await;
        if let Some((cached, factory)) = slot.as_ref()
            && *cached == key
        {
            return Ok(factory.clone());
        }
        let factory = MemoryFactory::connect(&setting).await?;
        *slot = Some((key, factory.clone()));
        Ok(factory)
    }

    fn notifier(&self) -> Result<Arc<dyn RoleNotifier>, Error> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn RoleNotifier>)
            .ok_or_else(|| Error::Internal("orchestrator is shutting down".into()))
    }

    /// Create or load the session and rebind it when the request targets
    /// another role or model.
    async fn resolve_session(
        &self,
        user_id: &str,
        role: &AgentRole,
        provider: &str,
        model: &str,
        session_id: Option<&str>,
        first_message: &str,
    ) -> Result<Session, Error> {
        let chats = &self.stores.chats;
        match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            None => {
                let session = Session::new(user_id, role, provider, model, Some(first_message));
                chats.create_session(&session).await?;
                info!(session_id = %session.id, role_id = %role.id, provider, model, "Session created");
                Ok(session)
            }
            Some(id) => {
                let mut session = chats.get_session(user_id, id).await?;
                if session.binding_differs(&role.id, provider, model) {
                    chats
                        .update_session_binding(&session.id, &role.id, &role.name, provider, model)
                        .await?;
                    debug!(session_id = %session.id, role_id = %role.id, provider, model, "Session rebound");
                    session.role_id = role.id.clone();
                    session.role_name = role.name.clone();
                    session.provider = provider.to_string();
                    session.model_name = model.to_string();
                }
                Ok(session)
            }
        }
    }

    async fn assemble(
        &self,
        user_id: &str,
        role: &AgentRole,
        provider: &str,
        model: &str,
        session_id: Option<&str>,
        first_message: &str,
    ) -> Result<Assembled, Error> {
        let session = self
            .resolve_session(user_id, role, provider, model, session_id, first_message)
            .await?;

        let agent = &self.settings.agent;
        let options = ChatOptions {
            temperature: agent.temperature,
            max_tokens: Some(agent.max_tokens),
            stop: agent.stop_sequences.clone(),
            timeout: Some(std::time::Duration::from_secs(agent.timeout_secs)),
        };
        let llm_setting = self.stores.settings.chat_llm().await;
        let llm = self.providers.build(&llm_setting, provider, model, options);

        let memory = self.memory_factory().await?.open(&session.id, 0);

        let experiences = match self.stores.experiences.list_for_role(&role.id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(role_id = %role.id, error = %e, "Listing experiences failed");
                Vec::new()
            }
        };
        let prompt = compose_system_prompt(role, &experiences);
        let tools = self.binder.bind(user_id, role, self.notifier()?).await;

        let engine = AgentEngine::new(llm, memory, self.limiter.clone())
            .with_tools(tools)
            .with_system_prompt(prompt)
            .with_config(EngineConfig::from(agent));

        Ok(Assembled {
            session,
            engine: Arc::new(engine),
            experience_ids: experiences.into_iter().map(|e| e.id).collect(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_blocking(
        &self,
        user_id: &str,
        role: &AgentRole,
        provider: &str,
        model: &str,
        session_id: Option<&str>,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, Error> {
        let (input_idx, input) = request.split_input()?;
        let first = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map_or(input, |m| m.content.as_str());

        let turn = self.assemble(user_id, role, provider, model, session_id, first).await?;
        let sid = turn.session.id.clone();

        let user_records: Vec<ChatMessage> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| ChatMessage::new(&sid, Role::User, m.content.clone()))
            .collect();
        self.stores.chats.insert_messages(&user_records).await?;

        let prior: Vec<cortex_core::Message> = request.messages[..input_idx]
            .iter()
            .map(|m| cortex_core::Message {
                role: m.role,
                ..cortex_core::Message::user(m.content.clone())
            })
            .collect();

        let result = turn.engine.execute(input, &prior, cancel).await?;
        let records = transcript_records(&sid, &result, &turn.experience_ids);
        self.stores.chats.insert_messages(&records).await?;

        let mut messages = user_records;
        messages.extend(records);
        Ok(ChatReply {
            session_id: sid,
            messages,
            result,
        })
    }

    async fn run_stream(
        &self,
        user_id: &str,
        role: &AgentRole,
        provider: &str,
        model: &str,
        session_id: Option<&str>,
        input: &str,
    ) -> Result<PreparedStream, Error> {
        if input.trim().is_empty() {
            return Err(Error::BadRequest("message must not be empty".into()));
        }
        let turn = self.assemble(user_id, role, provider, model, session_id, input).await?;
        let sid = turn.session.id.clone();
        self.stores
            .chats
            .insert_messages(&[ChatMessage::new(&sid, Role::User, input)])
            .await?;
        Ok(PreparedStream {
            session_id: sid,
            engine: turn.engine,
            input: input.to_string(),
            chats: self.stores.chats.clone(),
            experience_ids: turn.experience_ids,
        })
    }

    /// Run one blocking turn for a stored role.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        user_id: &str,
        role_id: &str,
        provider: &str,
        model: &str,
        session_id: Option<&str>,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, Error> {
        request.split_input()?;
        let role = self.stores.roles.get_role(role_id).await?;
        self.run_blocking(user_id, &role, provider, model, session_id, request, cancel)
            .await
    }

    /// Prepare a streaming turn for a stored role; the last user message is the input.
    pub async fn prepare_stream_message(
        &self,
        user_id: &str,
        role_id: &str,
        provider: &str,
        model: &str,
        session_id: Option<&str>,
        user_input: &str,
    ) -> Result<PreparedStream, Error> {
        let role = self.stores.roles.get_role(role_id).await?;
        self.run_stream(user_id, &role, provider, model, session_id, user_input)
            .await
    }

    /// The role behind a free-form request.
    async fn free_form_role(&self, request: &AgentChatRequest) -> Result<AgentRole, Error> {
        if let Some(role_id) = request.role_id.as_deref().filter(|r| !r.is_empty()) {
            return Ok(self.stores.roles.get_role(role_id).await?);
        }

        let prompt = match (&request.prompt_content, &request.prompt_key) {
            (Some(content), _) if !content.trim().is_empty() => content.clone(),
            (_, Some(key)) if !key.is_empty() => {
                match self.stores.settings.get(SETTINGS_GROUP_PROMPT, key).await? {
                    Some(serde_json::Value::String(s)) => s,
                    Some(serde_json::Value::Object(obj)) => obj
                        .get("content")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| Error::BadRequest(format!("prompt '{key}' has no content")))?,
                    _ => return Err(Error::NotFound(format!("prompt {key}"))),
                }
            }
            _ => {
                return Err(Error::BadRequest(
                    "one of role_id, prompt_content or prompt_key is required".into(),
                ));
            }
        };

        let mut role = AgentRole::new(AD_HOC_ROLE_ID, "Agent", prompt);
        if let Some(raw) = &request.prompt_config {
            let config: PromptConfig = serde_json::from_value(raw.clone())
                .map_err(|e| Error::BadRequest(format!("invalid prompt_config: {e}")))?;
            role.principle = config.principle;
            role.tool_config = config.tool_config.unwrap_or_default();
        }
        Ok(role)
    }

    fn free_form_binding<'a>(&'a self, request: &'a AgentChatRequest) -> (&'a str, &'a str) {
        (
            request
                .provider
                .as_deref()
                .filter(|p| !p.is_empty())
                .unwrap_or(&self.settings.notify.default_provider),
            request
                .model
                .as_deref()
                .filter(|m| !m.is_empty())
                .unwrap_or(&self.settings.notify.default_model),
        )
    }

    /// Blocking turn with a free-form system prompt.
    pub async fn agent_chat(
        &self,
        user_id: &str,
        request: &AgentChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, Error> {
        let role = self.free_form_role(request).await?;
        let (provider, model) = self.free_form_binding(request);
        let chat = ChatRequest::from_text(request.message.clone());
        self.run_blocking(user_id, &role, provider, model, request.session_id.as_deref(), &chat, cancel)
            .await
    }

    /// Streaming turn with a free-form system prompt.
    pub async fn prepare_agent_stream(&self, user_id: &str, request: &AgentChatRequest) -> Result<PreparedStream, Error> {
        let role = self.free_form_role(request).await?;
        let (provider, model) = self.free_form_binding(request);
        self.run_stream(user_id, &role, provider, model, request.session_id.as_deref(), &request.message)
            .await
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, Error> {
        Ok(self.stores.chats.list_sessions(user_id).await?)
    }

    pub async fn session_messages(&self, user_id: &str, session_id: &str) -> Result<Vec<ChatMessage>, Error> {
        Ok(self.stores.chats.list_messages(user_id, session_id).await?)
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), Error> {
        self.stores.chats.delete_session(user_id, session_id).await?;
        if let Ok(factory) = self.memory_factory().await
            && let Err(e) = factory.open(session_id, 0).clear().await
        {
            warn!(session_id, error = %e, "Clearing session memory failed");
        }
        info!(session_id, "Session deleted");
        Ok(())
    }

    /// Model ids offered by a provider's endpoint.
    pub async fn list_models(&self, provider: &str) -> Result<Vec<String>, Error> {
        let setting = self.stores.settings.chat_llm().await;
        Ok(self.providers.list_models(&setting, provider).await?)
    }
}

#[async_trait]
impl RoleNotifier for ChatOrchestrator {
    async fn notify_role(&self, user_id: &str, target_role_id: &str, message: &str) -> cortex_core::Result<String> {
        let notify = &self.settings.notify;
        info!(target_role_id, provider = %notify.default_provider, model = %notify.default_model, "Notifying role");
        let reply = self
            .send_message(
                user_id,
                target_role_id,
                &notify.default_provider,
                &notify.default_model,
                None,
                &ChatRequest::from_text(message),
                &CancellationToken::new(),
            )
            .await?;
        Ok(reply.result.output)
    }
}
