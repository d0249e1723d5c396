//! `cortex chat` — Interactive or single-message chat from the terminal.
//!
//! Runs the same orchestrator as the gateway against the configured
//! database, so sessions started here show up in the HTTP history.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use cortex_agent::{AgentChatRequest, AgentEvent, ChatOrchestrator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_PROMPT: &str = "You are a helpful assistant.";

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Stored role to chat with
    #[arg(short, long, conflicts_with = "prompt")]
    pub role: Option<String>,

    /// Free-form system prompt instead of a stored role
    #[arg(long)]
    pub prompt: Option<String>,

    /// Provider name (default: notify.default_provider)
    #[arg(long)]
    pub provider: Option<String>,

    /// Model name (default: notify.default_model)
    #[arg(long)]
    pub model: Option<String>,

    /// Send a single message instead of entering interactive mode
    #[arg(short, long)]
    pub message: Option<String>,

    /// Continue an existing session
    #[arg(short, long)]
    pub session: Option<String>,

    /// User the session belongs to
    #[arg(short, long, default_value = "local")]
    pub user: String,
}

struct Chat<'a> {
    orchestrator: Arc<ChatOrchestrator>,
    args: &'a ChatArgs,
    provider: String,
    model: String,
}

pub async fn run(config_path: Option<&Path>, args: ChatArgs) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let state = cortex_gateway::build_state(&config)
        .await
        .context("Failed to open the database")?;

    let chat = Chat {
        orchestrator: state.orchestrator.clone(),
        provider: args
            .provider
            .clone()
            .unwrap_or_else(|| config.notify.default_provider.clone()),
        model: args
            .model
            .clone()
            .unwrap_or_else(|| config.notify.default_model.clone()),
        args: &args,
    };

    if let Some(message) = &args.message {
        let session = chat.turn(args.session.as_deref(), message).await?;
        eprintln!("  session: {session}");
        return Ok(());
    }

    println!();
    println!("  Cortex — Interactive Mode");
    println!();
    match &args.role {
        Some(role) => println!("  Role:      {role}"),
        None => println!("  Prompt:    {}", args.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)),
    }
    println!("  Provider:  {}", chat.provider);
    println!("  Model:     {}", chat.model);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' to quit; Ctrl+C stops the current answer.");
    println!();

    let mut session = args.session.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit") {
            break;
        }

        match chat.turn(session.as_deref(), input).await {
            Ok(id) => session = Some(id),
            Err(e) => eprintln!("  [Error] {e:#}"),
        }
        println!();
    }

    println!();
    if let Some(id) = session {
        println!("  Session: {id}");
    }
    println!("  Goodbye!");
    Ok(())
}

impl Chat<'_> {
    /// Stream one turn to stdout. Returns the session id.
    async fn turn(&self, session: Option<&str>, input: &str) -> anyhow::Result<String> {
        let prepared = match &self.args.role {
            Some(role) => {
                self.orchestrator
                    .prepare_stream_message(&self.args.user, role, &self.provider, &self.model, session, input)
                    .await?
            }
            None => {
                let request = AgentChatRequest {
                    message: input.to_string(),
                    session_id: session.map(str::to_string),
                    prompt_content: Some(self.args.prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.into())),
                    provider: Some(self.provider.clone()),
                    model: Some(self.model.clone()),
                    ..Default::default()
                };
                self.orchestrator
                    .prepare_agent_stream(&self.args.user, &request)
                    .await?
            }
        };

        let session_id = prepared.session_id.clone();
        let cancel = CancellationToken::new();
        let mut rx = prepared.start(cancel.clone())?;

        print!("  Assistant > ");
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    debug!(session_id = %session_id, "Interrupted by user");
                    cancel.cancel();
                    continue;
                }
            };
            let Some(event) = event else { break };
            match event {
                AgentEvent::Chunk { content } => {
                    print!("{content}");
                    std::io::stdout().flush()?;
                }
                AgentEvent::ToolCalls { tool_calls } => {
                    let names: Vec<&str> = tool_calls.iter().map(|c| c.name()).collect();
                    eprintln!();
                    eprintln!("  [tools] {}", names.join(", "));
                }
                AgentEvent::Info { message } => eprintln!("  [info] {message}"),
                AgentEvent::End { .. } => println!(),
                AgentEvent::Error { error } => {
                    println!();
                    eprintln!("  [Error] {error}");
                }
            }
        }
        Ok(session_id)
    }
}
