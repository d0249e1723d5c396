//! `cortex models` — List the models a provider's endpoint offers.

use std::path::Path;

use anyhow::Context;
use cortex_providers::ProviderFactory;

pub async fn run(config_path: Option<&Path>, provider: &str) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let models = ProviderFactory::new()
        .list_models(&config.llm, provider)
        .await
        .with_context(|| format!("Failed to list models for {provider}"))?;

    if models.is_empty() {
        println!("No models reported by {provider}");
    }
    for model in models {
        println!("{model}");
    }
    Ok(())
}
