//! # Cortex Core
//!
//! Domain types, traits, and error definitions for the Cortex agent server.
//! This crate has **zero framework dependencies** — it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration (memory backends, stores)
//! - Easy testing with stub providers and in-process stores
//! - Clean dependency graph (all crates depend inward on core)

pub mod domain;
pub mod error;
pub mod memory;
pub mod message;
pub mod notify;
pub mod provider;
pub mod sse;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use domain::{
    AgentRole, ChatMessage, Experience, HumanNotification, McpServerConfig, RoleNotification,
    Session, SmtpConfig, ToolConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use memory::{MemoryProvider, MemoryVariables};
pub use message::{ContentPart, FunctionCall, Message, Role, ToolCall};
pub use notify::RoleNotifier;
pub use provider::{ChatOptions, ChatResponse, LlmProvider, StreamEvent, ToolDefinition, Usage};
pub use sse::LineBuffer;
pub use store::{ChatStore, ExperienceQuery, ExperienceStore, RoleStore, SettingsStore};
pub use tool::{Tool, ToolMetadata, ToolSet, ToolType};
