// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use berth_core::domain::config::ConfigError;
use berth_core::domain::subsystem::SubsystemError;

use super::channel::ChannelError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent is not running (start it with `berth agent start`)")]
    NotRunning,

    #[error("Could not stop the agent process{}", pid.map(|pid| format!(" {}", pid)).unwrap_or_default())]
    Stop { pid: Option<u32> },

    #[error(
        "Virtual machine '{name}' did not start within {timeout:?}{}",
        screenshot.as_ref().map(|path| format!(" (screenshot: {})", path.display())).unwrap_or_default()
    )]
    VmStart {
        name: String,
        timeout: Duration,
        screenshot: Option<PathBuf>,
    },

    #[error("Detached agent exited during startup ({code:?}), see {}", log.display())]
    Launch { code: Option<i32>, log: PathBuf },

    /// The agent answered a control request with `fail`
    #[error("Agent rejected '{action}': {message}")]
    Rejected { action: String, message: String },

    #[error("Unexpected response to '{action}': {message}")]
    Protocol { action: String, message: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Subsystem(#[from] SubsystemError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
