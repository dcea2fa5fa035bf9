// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the berth CLI

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use berth_core::domain::config::BerthConfig;
use berth_core::domain::progress::{AgentStatus, ProgressEvent, ProgressSink};
use berth_core::domain::subsystem::DisabledBalancer;
use berth_core::infrastructure::event_bus::EventBus;
use berth_core::presentation::ApiServer;

use crate::daemon::{
    AgentLifecycle, ControlClient, DaemonProcess, DaemonServer, DetachedAgent, PidFile, PidRecord,
    UnsupportedVmDriver,
};

pub mod agent;
pub mod config;
pub mod sync;
pub mod system;

pub use self::agent::AgentCommand;
pub use self::config::ConfigCommand;
pub use self::sync::SyncCommand;
pub use self::system::SystemCommand;

/// Configuration overrides given as repeated `--set key=value`
pub type Overrides = BTreeMap<String, Value>;

/// Parse `key=value`; the value is read as JSON when it parses, else kept
/// as a plain string.
pub fn parse_override(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("missing key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub(crate) fn load_config(config_path: Option<PathBuf>) -> Result<BerthConfig> {
    let config = BerthConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// The agent as this process would run it
pub(crate) fn build_daemon(config: &BerthConfig) -> (Arc<DaemonProcess>, Arc<dyn PidRecord>) {
    let pid: Arc<dyn PidRecord> = Arc::new(PidFile::new(config.paths.agent_pid.clone()));
    let events = EventBus::with_default_capacity();
    let server = DaemonServer::new(
        Arc::new(ApiServer::new(events.clone())),
        Arc::new(UnsupportedVmDriver),
        Arc::new(DisabledBalancer),
    );
    let process = Arc::new(DaemonProcess::new(config.clone(), server, pid.clone(), events));
    (process, pid)
}

/// Client whose start/stop manage a detached agent
pub(crate) fn build_client(config: BerthConfig, config_path: Option<PathBuf>) -> Result<ControlClient> {
    let (process, pid) = build_daemon(&config);
    let executable = std::env::current_exe().context("Failed to get current executable path")?;
    let agent: Arc<dyn AgentLifecycle> =
        Arc::new(DetachedAgent::new(process, pid.clone(), executable, config_path));
    Ok(ControlClient::new(config, pid, agent))
}

/// Sink printing progress for a terminal user
pub fn progress_printer() -> ProgressSink {
    ProgressSink::new(|event| match event {
        ProgressEvent::Status { status, pid, data } => {
            let pid = pid.map(|pid| format!(" (PID: {})", pid)).unwrap_or_default();
            match status {
                AgentStatus::Started => println!("{}", format!("✓ Agent started{}", pid).green()),
                AgentStatus::Stopped => println!("{}", "✓ Agent stopped".green()),
                AgentStatus::AlreadyRunning => {
                    println!("{}", format!("Agent already running{}", pid).yellow())
                }
                AgentStatus::NotRunning => println!("{}", "Agent is not running".yellow()),
                AgentStatus::Error => eprintln!(
                    "{}",
                    format!("✗ Agent error: {}", data.unwrap_or_default()).red()
                ),
                AgentStatus::Starting | AgentStatus::Stopping => {
                    println!("Agent {}{}...", status, pid)
                }
            }
        }
        ProgressEvent::Context { context, message } => {
            println!("  [{}] {}", context.cyan(), message)
        }
        ProgressEvent::Sync { status } => println!("  sync {}", status),
        ProgressEvent::Pull { system, id, status } => match id {
            Some(id) => println!("  [{}] {}: {}", system.cyan(), id, status),
            None => println!("  [{}] {}", system.cyan(), status),
        },
        ProgressEvent::Provision { system } => println!("  [{}] provisioning", system.cyan()),
        ProgressEvent::Wait { system, host, port } => {
            println!("  [{}] waiting for {}:{}", system.cyan(), host, port)
        }
        ProgressEvent::KillService { system } => println!("  [{}] killing", system.cyan()),
        ProgressEvent::StopService { system } => println!("  [{}] stopping", system.cyan()),
        ProgressEvent::Stopped { id } => println!("  stopped {}", id.dimmed()),
    })
}
