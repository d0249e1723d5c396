//! Cortex CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP gateway
//! - `chat`    — Chat with a role (or a free-form prompt) from the terminal
//! - `models`  — List the models a provider offers
//! - `doctor`  — Diagnose config, database and LLM endpoint

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "cortex",
    about = "Cortex — multi-tenant conversational agent server",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (default ~/.cortex/config.toml)
    #[arg(short, long, global = true, env = "CORTEX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Chat from the terminal
    Chat(commands::chat::ChatArgs),

    /// List the models a provider offers
    Models {
        /// Provider name as used in chat URLs
        provider: String,
    },

    /// Diagnose system health
    Doctor,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Serve { port } => commands::serve::run(config, port).await?,
        Commands::Chat(args) => commands::chat::run(config, args).await?,
        Commands::Models { provider } => commands::models::run(config, &provider).await?,
        Commands::Doctor => commands::doctor::run(config).await?,
    }

    Ok(())
}
