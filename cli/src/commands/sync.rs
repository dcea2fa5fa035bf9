// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File-sync watcher commands
//!
//! Commands: watch, unwatch, list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};
use std::path::PathBuf;

use berth_core::domain::progress::ProgressSink;

use super::{build_client, load_config, progress_printer};

#[derive(Subcommand)]
pub enum SyncCommand {
    /// Keep a host folder in sync with the agent
    Watch {
        #[arg(value_name = "HOST_FOLDER")]
        host_folder: PathBuf,

        /// Destination inside the VM (default: under agent.vm.mount_point)
        #[arg(value_name = "GUEST_FOLDER")]
        guest_folder: Option<String>,

        /// Paths left out of the sync (repeatable)
        #[arg(long = "except", value_name = "PATTERN")]
        except: Vec<String>,
    },

    /// Stop syncing a host folder
    Unwatch {
        #[arg(value_name = "HOST_FOLDER")]
        host_folder: PathBuf,

        #[arg(value_name = "GUEST_FOLDER")]
        guest_folder: Option<String>,
    },

    /// List active watchers
    List,
}

pub async fn handle_command(command: SyncCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.clone())?;
    let mut client = build_client(config, config_path)?;
    client.require(&ProgressSink::noop()).await?;

    let result = match command {
        SyncCommand::Watch {
            host_folder,
            guest_folder,
            except,
        } => {
            let host_folder = std::fs::canonicalize(&host_folder)
                .with_context(|| format!("Folder {} does not exist", host_folder.display()))?;
            let guest_folder = guest_folder.unwrap_or_else(|| {
                let name = host_folder
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}/{}", client.config().agent.vm.mount_point.trim_end_matches('/'), name)
            });
            let opts = if except.is_empty() {
                Value::Null
            } else {
                json!({ "except": except })
            };
            client
                .watch(&host_folder, &guest_folder, opts, &progress_printer())
                .await
                .map(|_| {
                    println!(
                        "{}",
                        format!("✓ Watching {} -> {}", host_folder.display(), guest_folder).green()
                    );
                })
        }
        SyncCommand::Unwatch {
            host_folder,
            guest_folder,
        } => client
            .unwatch(&host_folder, guest_folder.as_deref())
            .await
            .map(|_| println!("{}", format!("✓ Stopped watching {}", host_folder.display()).green())),
        SyncCommand::List => client.watchers().await.map(|watchers| {
            if watchers.is_empty() {
                println!("No active watchers.");
            }
            for watcher in watchers {
                println!(
                    "  {} -> {} ({} files, since {})",
                    watcher.host_folder.bold(),
                    watcher.guest_folder,
                    watcher.files,
                    watcher.since.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }),
    };

    client.close();
    result.map_err(Into::into)
}
