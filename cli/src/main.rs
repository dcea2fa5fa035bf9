// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # berth
//!
//! Development environment orchestrator: runs project systems as
//! containers and supervises a background agent.
//!
//! ## Architecture
//!
//! - **Default mode**: commands talk to the agent over its unix socket
//! - **Daemon mode**: `berth --daemon` runs the agent in the foreground;
//!   `berth agent start` re-executes itself that way, detached
//! - **Detection**: the agent pid file
//!
//! ## Commands
//!
//! - `berth agent start|stop|status` - Manage the agent
//! - `berth sync watch|unwatch|list` - File-sync watchers
//! - `berth system provision|run|shell|stop|ps` - Run project systems
//! - `berth config show|validate|get` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use berth_cli::commands::{self, parse_override, AgentCommand, ConfigCommand, SyncCommand, SystemCommand};

/// berth - development environments in containers
#[derive(Parser)]
#[command(name = "berth")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run the agent in this process
    #[arg(long, global = true, hide = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "BERTH_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Override a configuration key, e.g. `--set agent:requires_vm=false`
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_override)]
    overrides: Vec<(String, serde_json::Value)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BERTH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the agent daemon
    #[command(name = "agent")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// File-sync watchers
    #[command(name = "sync")]
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },

    /// Run project systems
    #[command(name = "system")]
    System {
        /// Systems file (default: ./berth-systems.yaml)
        #[arg(short, long, value_name = "FILE")]
        file: Option<PathBuf>,

        #[command(subcommand)]
        command: SystemCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level)?;

    let overrides = cli.overrides.into_iter().collect();

    // Handle daemon mode (background service)
    if cli.daemon {
        info!("Starting berth agent in daemon mode");
        return commands::agent::run_foreground(cli.config, overrides).await;
    }

    match cli.command {
        Some(Commands::Agent { command }) => {
            commands::agent::handle_command(command, cli.config, overrides).await
        }
        Some(Commands::Sync { command }) => commands::sync::handle_command(command, cli.config).await,
        Some(Commands::System { file, command }) => {
            commands::system::handle_command(command, cli.config, overrides, file).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config, overrides).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
