//! Subcommand implementations.

pub mod chat;
pub mod doctor;
pub mod models;
pub mod serve;

use std::path::Path;

use anyhow::Context;
use cortex_config::AppConfig;

/// `--config` when given, otherwise `~/.cortex/config.toml`. Env overrides apply to both.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(p) => AppConfig::load_with_env(p),
        None => AppConfig::load(),
    };
    config.context("Failed to load config")
}
