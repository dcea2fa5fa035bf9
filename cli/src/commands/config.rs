// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, get

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use berth_core::domain::config::BerthConfig;
use berth_core::domain::progress::ProgressSink;

use super::{build_client, Overrides};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Show the configuration of the running agent instead
        #[arg(long)]
        remote: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Print a single value by key, e.g. `agent:vm:ip`
    Get {
        #[arg(value_name = "KEY")]
        key: String,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, remote } => show(config_override, overrides, paths, remote).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Get { key } => get(config_override, overrides, &key).await,
    }
}

fn effective(config_override: Option<PathBuf>, overrides: &Overrides) -> Result<BerthConfig> {
    BerthConfig::load_or_default(config_override)
        .context("Failed to load configuration")?
        .merge(overrides)
        .context("Failed to apply --set overrides")
}

async fn show(
    config_override: Option<PathBuf>,
    overrides: Overrides,
    show_paths: bool,
    remote: bool,
) -> Result<()> {
    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. BERTH_CONFIG_PATH: {}",
            std::env::var("BERTH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./berth.yaml");
        println!("  4. ~/.berth/config.yaml");
        println!("  5. /etc/berth/config.yaml");
        println!();
    }

    let config = effective(config_override.clone(), &overrides)?;
    if remote {
        let mut client = build_client(config, config_override)?;
        client
            .require(&ProgressSink::noop())
            .await
            .context("Cannot read the agent configuration")?;
        println!("{}", "Agent configuration:".bold());
        println!();
        for (key, value) in client.config().flatten() {
            println!("  {} = {}", key.cyan(), value);
        }
        client.close();
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();
    print!("{}", config.to_yaml().context("Failed to render configuration")?);
    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BerthConfig::load_or_default(config_path).context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn get(config_override: Option<PathBuf>, overrides: Overrides, key: &str) -> Result<()> {
    let config = effective(config_override, &overrides)?;
    match config.get(key) {
        Some(value) => {
            println!("{}", value);
            Ok(())
        }
        None => anyhow::bail!("Unknown configuration key '{}'", key),
    }
}
