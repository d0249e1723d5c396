//! `cortex serve` — Start the HTTP API server.

use std::path::Path;

pub async fn run(config_path: Option<&Path>, port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = super::load_config(config_path)?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Cortex Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "   Auth:      {}",
        if config.auth.is_open() {
            "open (local user)".to_string()
        } else {
            format!("{} bearer token(s)", config.auth.tokens.len())
        }
    );

    cortex_gateway::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("Gateway failed: {e}"))
}
