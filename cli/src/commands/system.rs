// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! System commands
//!
//! Commands: provision, run, shell, stop, ps

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_core::application::{DaemonOptions, ProvisionOptions, ShellOptions, StopOptions, SystemRunner};
use berth_core::domain::tracker::tracker_for;
use berth_core::infrastructure::{ContainerRuntime, DockerEngine};

use super::{load_config, progress_printer, Overrides};
use crate::manifest::{Manifest, DEFAULT_SYSTEMS_FILE};

#[derive(Subcommand)]
pub enum SystemCommand {
    /// Run a system's provision steps
    Provision {
        #[arg(value_name = "SYSTEM")]
        system: String,

        /// Run again even if provisioned before
        #[arg(short, long)]
        force: bool,

        /// Use the local image only
        #[arg(long)]
        no_pull: bool,
    },

    /// Start a system in the background and wait until it answers
    Run {
        #[arg(value_name = "SYSTEM")]
        system: String,

        #[arg(long)]
        no_pull: bool,

        /// Availability attempts (default: docker.run.retry)
        #[arg(long)]
        retry: Option<u32>,

        /// Bound per availability attempt in milliseconds (default: docker.run.timeout_ms)
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,
    },

    /// Run a one-off command in a system's container
    Shell {
        #[arg(value_name = "SYSTEM")]
        system: String,

        /// Remove the container afterwards
        #[arg(long)]
        rm: bool,

        #[arg(long)]
        no_pull: bool,

        #[arg(value_name = "COMMAND", trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Stop every instance of a system
    Stop {
        #[arg(value_name = "SYSTEM")]
        system: String,

        /// Kill instead of stopping gracefully
        #[arg(short, long)]
        kill: bool,

        /// Keep the stopped containers
        #[arg(long)]
        keep: bool,
    },

    /// List a system's instances
    Ps {
        #[arg(value_name = "SYSTEM")]
        system: String,
    },
}

pub async fn handle_command(
    command: SystemCommand,
    config_path: Option<PathBuf>,
    overrides: Overrides,
    file: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path)?
        .merge(&overrides)
        .context("Failed to apply --set overrides")?;
    let mut manifest = Manifest::load(file.unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEMS_FILE)))?;

    let engine = DockerEngine::new(config.docker.socket_path.as_deref())
        .context("Failed to connect to the container engine")?;
    engine
        .healthcheck()
        .await
        .context("Container engine is not responding")?;
    let runtime = ContainerRuntime::new(
        Arc::new(engine),
        tracker_for(&config.tracking),
        config.namespace.clone(),
    );
    let runner = SystemRunner::new(runtime, config);
    let progress = progress_printer();

    match command {
        SystemCommand::Provision {
            system,
            force,
            no_pull,
        } => {
            let mut system = manifest.system(&system)?;
            let options = ProvisionOptions {
                force,
                image_pull: !no_pull,
            };
            if runner.run_provision(&mut system, options, &progress).await? {
                manifest.record_provisioned(&system)?;
                println!("{}", format!("✓ Provisioned {}", system.name).green());
            } else {
                println!("Nothing to provision for {}", system.name);
            }
        }
        SystemCommand::Run {
            system,
            no_pull,
            retry,
            timeout,
        } => {
            let mut system = manifest.system(&system)?;
            let before = system.provisioned;
            let options = DaemonOptions {
                image_pull: !no_pull,
                retry,
                timeout: timeout.map(Duration::from_millis),
                ..DaemonOptions::default()
            };
            let result = runner.run_daemon(&mut system, options, &progress).await;
            if system.provisioned != before {
                manifest.record_provisioned(&system)?;
            }
            let container = result?;
            println!(
                "{}",
                format!("✓ {} running in {}", system.name, container.id).green()
            );
            for (port, access) in &container.access {
                if let Some(published) = access.port {
                    println!("  {} -> {}", port, published);
                }
            }
        }
        SystemCommand::Shell {
            system,
            rm,
            no_pull,
            command,
        } => {
            let system = manifest.system(&system)?;
            let options = ShellOptions {
                remove: rm,
                image_pull: !no_pull,
                capture_output: true,
            };
            let result = runner.run_shell(&system, command, options, &progress).await?;
            if let Some(output) = &result.output {
                print!("{}", output);
            }
            if result.exit_code != 0 {
                anyhow::bail!("Command exited with code {}", result.exit_code);
            }
        }
        SystemCommand::Stop { system, kill, keep } => {
            let system = manifest.system(&system)?;
            let options = StopOptions { kill, remove: !keep };
            runner.stop(&system, vec![], options, &progress).await?;
            println!("{}", format!("✓ Stopped {}", system.name).green());
        }
        SystemCommand::Ps { system } => {
            let system = manifest.system(&system)?;
            let instances = runner.instances(&system).await?;
            if instances.is_empty() {
                println!("No instances of {}", system.name);
            }
            for container in instances {
                let state = if container.state.running {
                    "running".green()
                } else {
                    format!("exited ({})", container.state.exit_code).red()
                };
                println!("  {}  {}  {}", container.id, container.name, state);
            }
        }
    }
    Ok(())
}
