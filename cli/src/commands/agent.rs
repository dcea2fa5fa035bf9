// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent lifecycle commands
//!
//! Commands: start, stop, status

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use berth_core::domain::progress::ProgressSink;

use super::{build_client, build_daemon, load_config, progress_printer, Overrides};
use crate::daemon::StartOutcome;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Start the agent (if not already running)
    Start {
        /// Run in the foreground instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the agent gracefully
    Stop,

    /// Check agent status
    Status,
}

pub async fn handle_command(
    command: AgentCommand,
    config_path: Option<PathBuf>,
    overrides: Overrides,
) -> Result<()> {
    match command {
        AgentCommand::Start { foreground: true } => run_foreground(config_path, overrides).await,
        AgentCommand::Start { foreground: false } => start(config_path, overrides).await,
        AgentCommand::Stop => stop(config_path).await,
        AgentCommand::Status => status(config_path).await,
    }
}

/// Run the agent in this process until it is signalled to stop.
pub async fn run_foreground(config_path: Option<PathBuf>, overrides: Overrides) -> Result<()> {
    let config = load_config(config_path)?;
    let (process, _) = build_daemon(&config);

    info!("Starting berth agent in the foreground");
    match process.run(overrides, progress_printer()).await? {
        StartOutcome::Stopped { code } if code != 0 => {
            anyhow::bail!("Agent stopped with errors (exit code {})", code)
        }
        _ => Ok(()),
    }
}

async fn start(config_path: Option<PathBuf>, overrides: Overrides) -> Result<()> {
    let config = load_config(config_path.clone())?;
    let client = build_client(config, config_path)?;

    println!(
        "Redirecting agent logs to: {}",
        std::env::temp_dir().join("berth-agent.out").display()
    );
    let outcome = client
        .start(overrides, progress_printer())
        .await
        .context("Failed to start the agent")?;

    if let StartOutcome::AlreadyRunning { .. } = outcome {
        println!("Use 'berth agent stop' to stop it first.");
    } else {
        println!("Check status with: berth agent status");
    }
    Ok(())
}

async fn stop(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.clone())?;
    let client = build_client(config, config_path)?;
    client
        .stop(progress_printer())
        .await
        .context("Failed to stop the agent")
}

async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.clone())?;
    let client = build_client(config, config_path)?;

    let snapshot = client.status(&ProgressSink::noop());
    if !snapshot.agent {
        println!("{}", "✗ Agent is not running".red());
        return Ok(());
    }

    println!("{}", "✓ Agent is running".green());
    if let Some(pid) = snapshot.pid {
        println!("  PID: {}", pid);
    }
    println!("  API socket: {}", client.config().paths.api_socket.display());

    match client.watchers().await {
        Ok(watchers) => println!("  Watchers: {}", watchers.len()),
        Err(e) => println!("{}", format!("  ⚠ Control channel unavailable: {}", e).yellow()),
    }
    client.close();
    Ok(())
}
