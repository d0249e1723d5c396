//! The agent side of Cortex.
//!
//! The engine follows a **call → act → observe** cycle:
//!
//! 1. **Load** the session history from memory and append the user input
//! 2. **Call** the LLM with the bound tools
//! 3. **If tool calls**: run them in provider order, append the results, go to 2
//! 4. **If text**: save the exchange to memory and return it
//!
//! The loop stops at the first text-only answer or after `max_iterations`
//! LLM calls. The [`ChatOrchestrator`] wraps the engine with session
//! resolution, prompt composition, tool binding and chat persistence.

pub mod binder;
pub mod cache;
pub mod engine;
pub mod events;
pub mod orchestrator;
pub mod prompt;

pub use binder::ToolBinder;
pub use cache::ToolCache;
pub use engine::{AgentEngine, EngineConfig};
pub use events::{AgentEvent, AgentResult, ToolCallTrace};
pub use orchestrator::{
    AgentChatRequest, ChatInput, ChatOrchestrator, ChatReply, ChatRequest, OrchestratorSettings, PreparedStream,
    ProviderSource, Stores,
};
pub use prompt::compose_system_prompt;
