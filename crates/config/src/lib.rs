//! Configuration loading, validation, and management for Cortex.
//!
//! Loads configuration from `~/.cortex/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! The `[llm]` and `[memory]` sections double as the JSON payloads stored in
//! the runtime `settings` table (`llm/chat_config`, `memory/config`); a stored
//! value takes priority over the file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Settings-table coordinates of the chat-LLM configuration.
pub const SETTINGS_GROUP_LLM: &str = "llm";
pub const SETTINGS_KEY_CHAT_CONFIG: &str = "chat_config";
/// Settings-table coordinates of the memory configuration.
pub const SETTINGS_GROUP_MEMORY: &str = "memory";
pub const SETTINGS_KEY_MEMORY_CONFIG: &str = "config";

/// Window size when no memory block sets one.
pub const DEFAULT_MAX_HISTORY_MESSAGES: usize = 100;

/// The root configuration structure.
///
/// Maps directly to `~/.cortex/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Bearer token → user id
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Chat-LLM setting seed
    #[serde(default)]
    pub llm: ChatLlmSetting,

    /// Memory setting seed
    #[serde(default)]
    pub memory: MemorySetting,

    /// Agent engine defaults
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

// ---------------------------------------------------------------------------
// Gateway / auth / database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum request body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit: default_body_limit(),
        }
    }
}

/// Static bearer tokens. With no tokens configured every request runs as
/// the `local` user.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl AuthConfig {
    pub fn user_for(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tokens", &format!("[{} REDACTED]", self.tokens.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    format!(
        "sqlite://{}?mode=rwc",
        AppConfig::config_dir().join("cortex.db").display()
    )
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat-LLM setting
// ---------------------------------------------------------------------------

/// How to reach the OpenAI-compatible endpoint(s).
///
/// Top-level fields are the defaults; `providers` overrides them per
/// provider name as it appears in the chat URL.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChatLlmSetting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// `openai`, `azure`, `volce`, ...
    #[serde(default = "default_api_type")]
    pub api_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    /// 429 retries per LLM call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Sleep used when a 429 message carries no delay
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_rate_capacity")]
    pub rate_limit_capacity: u32,

    #[serde(default = "default_rate_refill")]
    pub rate_limit_refill_per_sec: f64,

    #[serde(default)]
    pub providers: HashMap<String, ProviderEndpoint>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_type() -> String {
    "openai".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_rate_capacity() -> u32 {
    10
}
fn default_rate_refill() -> f64 {
    10.0
}

impl Default for ChatLlmSetting {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            api_type: default_api_type(),
            organization: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            rate_limit_capacity: default_rate_capacity(),
            rate_limit_refill_per_sec: default_rate_refill(),
            providers: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for ChatLlmSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatLlmSetting")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("api_type", &self.api_type)
            .field("organization", &self.organization)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("rate_limit_capacity", &self.rate_limit_capacity)
            .field("rate_limit_refill_per_sec", &self.rate_limit_refill_per_sec)
            .field("providers", &self.providers)
            .finish()
    }
}

/// Per-provider override of the chat-LLM defaults.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl std::fmt::Debug for ProviderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpoint")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("api_type", &self.api_type)
            .field("organization", &self.organization)
            .finish()
    }
}

/// The endpoint a provider name resolves to.
#[derive(Clone)]
pub struct ResolvedEndpoint {
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub api_type: String,
    pub organization: Option<String>,
}

impl std::fmt::Debug for ResolvedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEndpoint")
            .field("provider", &self.provider)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("api_type", &self.api_type)
            .finish()
    }
}

impl ChatLlmSetting {
    /// Merge the per-provider override over the defaults.
    pub fn resolve(&self, provider: &str) -> ResolvedEndpoint {
        let over = self.providers.get(provider).cloned().unwrap_or_default();
        ResolvedEndpoint {
            provider: provider.to_string(),
            api_key: over.api_key.or_else(|| self.api_key.clone()),
            base_url: over.base_url.unwrap_or_else(|| self.base_url.clone()),
            api_type: over.api_type.unwrap_or_else(|| self.api_type.clone()),
            organization: over.organization.or_else(|| self.organization.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory setting
// ---------------------------------------------------------------------------

/// Which memory backend to open and how.
///
/// When `backend` is unset the first configured block wins, in the order
/// simple, sqlite, mysql, mongodb, redis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySetting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple: Option<SimpleMemoryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqlMemoryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<SqlMemoryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongodb: Option<MongoMemoryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisMemoryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimpleMemoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history_messages: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlMemoryConfig {
    /// sqlx connection URL (`sqlite://...`, `mysql://...`)
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history_messages: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoMemoryConfig {
    pub uri: String,
    #[serde(default = "default_mongo_database")]
    pub database: String,
    #[serde(default = "default_mongo_collection")]
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history_messages: Option<usize>,
}

fn default_mongo_database() -> String {
    "cortex".into()
}
fn default_mongo_collection() -> String {
    "memory_messages".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisMemoryConfig {
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history_messages: Option<usize>,
}

fn default_redis_prefix() -> String {
    "cortex:memory".into()
}

impl MemorySetting {
    /// Window size from the first block that sets one; 100 otherwise.
    pub fn max_history_messages(&self) -> usize {
        [
            self.simple.as_ref().and_then(|c| c.max_history_messages),
            self.sqlite.as_ref().and_then(|c| c.max_history_messages),
            self.mysql.as_ref().and_then(|c| c.max_history_messages),
            self.mongodb.as_ref().and_then(|c| c.max_history_messages),
            self.redis.as_ref().and_then(|c| c.max_history_messages),
        ]
        .into_iter()
        .flatten()
        .find(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_HISTORY_MESSAGES)
    }

    /// The backend name to open.
    pub fn selected_backend(&self) -> &str {
        if let Some(b) = self.backend.as_deref() {
            return b;
        }
        if self.simple.is_some() {
            "simple"
        } else if self.sqlite.is_some() {
            "sqlite"
        } else if self.mysql.is_some() {
            "mysql"
        } else if self.mongodb.is_some() {
            "mongodb"
        } else if self.redis.is_some() {
            "redis"
        } else {
            "simple"
        }
    }
}

// ---------------------------------------------------------------------------
// Agent / notify / tools
// ---------------------------------------------------------------------------

/// Reasoning-loop defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// Per LLM call
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_execution_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub enable_tool_retry: bool,

    #[serde(default = "default_max_history")]
    pub max_history_messages: usize,

    #[serde(default)]
    pub enable_memory_compress: bool,

    #[serde(default = "default_compress_threshold")]
    pub memory_compress_threshold: usize,

    #[serde(default = "default_compress_ratio")]
    pub memory_compress_ratio: f32,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY_MESSAGES
}
fn default_compress_threshold() -> usize {
    50
}
fn default_compress_ratio() -> f32 {
    0.5
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stop_sequences: Vec::new(),
            timeout_secs: default_llm_timeout_secs(),
            tool_execution_timeout_secs: default_tool_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_tool_retry: true,
            max_history_messages: default_max_history(),
            enable_memory_compress: false,
            memory_compress_threshold: default_compress_threshold(),
            memory_compress_ratio: default_compress_ratio(),
        }
    }
}

/// The `(provider, model)` used when one role notifies another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_provider")]
    pub default_provider: String,

    #[serde(default = "default_notify_model")]
    pub default_model: String,
}

fn default_notify_provider() -> String {
    "openai".into()
}
fn default_notify_model() -> String {
    "gpt-4o-mini".into()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            default_provider: default_notify_provider(),
            default_model: default_notify_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Restrict the `file` tool to this directory when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_root: Option<PathBuf>,
}

fn default_command_timeout() -> u64 {
    60
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            file_root: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from the default path with env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_dir().join("config.toml");
        Self::load_with_env(&path)
    }

    /// Load from `path`, apply env overrides, validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("CORTEX_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("CORTEX_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(url) = lookup("CORTEX_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(port) = lookup("CORTEX_PORT") {
            self.gateway.port = port
                .parse()
                .map_err(|_| ConfigError::ValidationError(format!("CORTEX_PORT is not a port: {port}")))?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".cortex")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations < 1 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        let ratio = self.agent.memory_compress_ratio;
        if ratio <= 0.0 || ratio > 1.0 {
            return Err(ConfigError::ValidationError(
                "agent.memory_compress_ratio must be in (0, 1]".into(),
            ));
        }

        if self.llm.rate_limit_capacity == 0 || self.llm.rate_limit_refill_per_sec <= 0.0 {
            return Err(ConfigError::ValidationError(
                "llm rate limit capacity and refill must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
