//! `cortex doctor` — Diagnose config, database and LLM endpoint.

use std::path::Path;
use std::time::Duration;

use cortex_config::AppConfig;
use cortex_db::SqliteStore;
use cortex_providers::ProviderFactory;

const ENDPOINT_DEADLINE: Duration = Duration::from_secs(10);

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Cortex Doctor — System Diagnostics");
    println!("==================================\n");

    let mut issues = 0;

    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    if !path.exists() {
        println!("  ⚠️  No config file at {}, using defaults", path.display());
    }
    let config = match super::load_config(config_path) {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e:#}");
            println!("\n  1 issue found. Fix the config before running other checks.");
            return Ok(());
        }
    };

    match SqliteStore::connect(&config.database.url, config.database.max_connections).await {
        Ok(store) => match store.ping().await {
            Ok(()) => println!("  ✅ Database reachable"),
            Err(e) => {
                println!("  ❌ Database ping failed: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ Database unreachable: {e}");
            issues += 1;
        }
    }

    if config.llm.api_key.is_some() {
        println!("  ✅ API key configured");
    } else {
        println!("  ⚠️  No API key configured — set CORTEX_API_KEY or llm.api_key");
        issues += 1;
    }

    let provider = &config.notify.default_provider;
    let catalog = tokio::time::timeout(
        ENDPOINT_DEADLINE,
        ProviderFactory::new().list_models(&config.llm, provider),
    )
    .await;
    match catalog {
        Ok(Ok(models)) => println!("  ✅ LLM endpoint answered ({provider}: {} models)", models.len()),
        Ok(Err(e)) => {
            println!("  ❌ LLM endpoint error ({provider}): {e}");
            issues += 1;
        }
        Err(_) => {
            println!("  ❌ LLM endpoint timed out ({provider})");
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
