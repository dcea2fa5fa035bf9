// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent client
//!
//! Used by CLI commands to check, start and stop the agent, and to talk to
//! a running agent over the control channel.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use berth_core::domain::config::BerthConfig;
use berth_core::domain::progress::{AgentStatus, ProgressEvent, ProgressSink};
use berth_core::presentation::protocol::{FrameStatus, Response, UnwatchRequest, WatchRequest};
use berth_core::presentation::Watcher;

use super::{AgentError, ControlChannel, DaemonProcess, PidRecord};

const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Slack on top of the VM boot timeout for a detached agent to come up
const LAUNCH_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Another agent holds the pid record
    AlreadyRunning { pid: Option<u32> },
    /// A detached agent is up
    Started { pid: u32 },
    /// An in-process agent ran and shut down with `code`
    Stopped { code: i32 },
}

/// Starting and stopping the agent daemon
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    async fn start(
        &self,
        overrides: BTreeMap<String, Value>,
        progress: ProgressSink,
    ) -> Result<StartOutcome, AgentError>;

    async fn stop(&self, progress: ProgressSink) -> Result<(), AgentError>;
}

/// Runs the agent as a background copy of the current executable
pub struct DetachedAgent {
    process: Arc<DaemonProcess>,
    pid: Arc<dyn PidRecord>,
    executable: PathBuf,
    config_path: Option<PathBuf>,
    log_dir: PathBuf,
}

impl DetachedAgent {
    pub fn new(
        process: Arc<DaemonProcess>,
        pid: Arc<dyn PidRecord>,
        executable: PathBuf,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            process,
            pid,
            executable,
            config_path,
            log_dir: std::env::temp_dir(),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    fn log_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.log_dir.join("berth-agent.out"),
            self.log_dir.join("berth-agent.err"),
        )
    }

    fn command(&self, overrides: &BTreeMap<String, Value>) -> Result<std::process::Command, AgentError> {
        let (stdout_path, stderr_path) = self.log_paths();
        let stdout = std::fs::File::create(&stdout_path)?;
        let stderr = std::fs::File::create(&stderr_path)?;

        let mut command = std::process::Command::new(&self.executable);
        command.arg("--daemon");
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        for (key, value) in overrides {
            command.arg("--set").arg(format!("{}={}", key, value));
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach from the terminal's process group
            command.process_group(0);
        }

        command
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        Ok(command)
    }
}

#[async_trait]
impl AgentLifecycle for DetachedAgent {
    async fn start(
        &self,
        overrides: BTreeMap<String, Value>,
        progress: ProgressSink,
    ) -> Result<StartOutcome, AgentError> {
        if self.pid.is_running() {
            let pid = self.pid.pid();
            progress.notify(ProgressEvent::Status {
                status: AgentStatus::AlreadyRunning,
                pid,
                data: None,
            });
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        // The agent applies the same overrides; refuse them before spawning.
        let config = self.process.config().merge(&overrides)?;
        config.validate()?;

        progress.notify(ProgressEvent::status(AgentStatus::Starting));
        let mut child = self.command(&overrides)?.spawn()?;
        info!("Spawned agent process {}", child.id());

        let deadline = tokio::time::Instant::now() + config.agent.vm.start_timeout() + LAUNCH_GRACE;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(AgentError::Launch {
                    code: status.code(),
                    log: self.log_paths().1,
                });
            }
            if self.pid.is_running() && config.paths.api_socket.exists() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Launch {
                    code: None,
                    log: self.log_paths().1,
                });
            }
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
        }

        let pid = child.id();
        progress.notify(ProgressEvent::Status {
            status: AgentStatus::Started,
            pid: Some(pid),
            data: None,
        });
        Ok(StartOutcome::Started { pid })
    }

    async fn stop(&self, progress: ProgressSink) -> Result<(), AgentError> {
        self.process.stop(&progress).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub agent: bool,
    pub pid: Option<u32>,
}

/// Arguments for reaching the managed VM over ssh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// `user@host`
    pub url: String,
    pub opts: Vec<String>,
}

pub struct ControlClient {
    config: BerthConfig,
    channel: ControlChannel,
    pid: Arc<dyn PidRecord>,
    agent: Arc<dyn AgentLifecycle>,
}

impl ControlClient {
    pub fn new(config: BerthConfig, pid: Arc<dyn PidRecord>, agent: Arc<dyn AgentLifecycle>) -> Self {
        let channel = ControlChannel::new(config.paths.api_socket.clone());
        Self {
            config,
            channel,
            pid,
            agent,
        }
    }

    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// Agent liveness read from the pid record
    pub fn status(&self, progress: &ProgressSink) -> StatusSnapshot {
        let agent = self.pid.is_running();
        let pid = if agent { self.pid.pid() } else { None };
        let status = if agent {
            AgentStatus::Started
        } else {
            AgentStatus::NotRunning
        };
        progress.notify(ProgressEvent::Status {
            status,
            pid,
            data: None,
        });
        StatusSnapshot { agent, pid }
    }

    pub async fn start(
        &self,
        overrides: BTreeMap<String, Value>,
        progress: ProgressSink,
    ) -> Result<StartOutcome, AgentError> {
        self.agent.start(overrides, progress).await
    }

    pub async fn stop(&self, progress: ProgressSink) -> Result<(), AgentError> {
        self.agent.stop(progress).await
    }

    /// Register a file-sync watcher; progress arrives as `sync` events.
    pub async fn watch(
        &self,
        host_folder: &Path,
        guest_folder: &str,
        opts: Value,
        progress: &ProgressSink,
    ) -> Result<bool, AgentError> {
        let request = WatchRequest {
            host_folder: host_folder.to_string_lossy().into_owned(),
            guest_folder: guest_folder.to_string(),
            opts,
        };
        let data = serde_json::to_value(&request).map_err(|e| protocol("watch", e))?;
        let mut exchange = self
            .channel
            .send("watch", data, self.config.client.send_retry)
            .await?;

        loop {
            let frame = exchange.next().await?;
            match frame.status {
                FrameStatus::Start => progress.notify(ProgressEvent::status(AgentStatus::Starting)),
                FrameStatus::Sync => progress.notify(ProgressEvent::Sync {
                    status: frame.data,
                }),
                FrameStatus::Done => {
                    exchange.close();
                    return Ok(true);
                }
                FrameStatus::Fail => {
                    exchange.close();
                    return Err(rejected("watch", frame));
                }
            }
        }
    }

    pub async fn unwatch(&self, host_folder: &Path, guest_folder: Option<&str>) -> Result<bool, AgentError> {
        let request = UnwatchRequest {
            host_folder: host_folder.to_string_lossy().into_owned(),
            guest_folder: guest_folder.map(str::to_string),
        };
        let data = serde_json::to_value(&request).map_err(|e| protocol("unwatch", e))?;
        let frame = self.round_trip("unwatch", data).await?;
        match frame.status {
            FrameStatus::Fail => Err(rejected("unwatch", frame)),
            _ => Ok(true),
        }
    }

    pub async fn watchers(&self) -> Result<Vec<Watcher>, AgentError> {
        let frame = self.round_trip("watchers", Value::Null).await?;
        if frame.status == FrameStatus::Fail {
            return Err(rejected("watchers", frame));
        }
        serde_json::from_value(frame.data).map_err(|e| protocol("watchers", e))
    }

    /// Flattened configuration of the running agent
    pub async fn configs(&self) -> Result<BTreeMap<String, Value>, AgentError> {
        let body = self.channel.fetch("/configs").await?;
        serde_json::from_value(body).map_err(|e| protocol("configs", e))
    }

    /// Fail unless the agent runs, then adopt its configuration.
    pub async fn require(&mut self, progress: &ProgressSink) -> Result<(), AgentError> {
        if !self.status(progress).agent {
            return Err(AgentError::NotRunning);
        }
        let remote = self.configs().await?;
        debug!("Adopting {} configuration keys from the agent", remote.len());
        self.config = self.config.merge(&remote)?;
        Ok(())
    }

    pub fn ssh_opts(&self) -> SshOptions {
        let vm = &self.config.agent.vm;
        SshOptions {
            url: format!("{}@{}", vm.user, vm.ip),
            opts: vec![
                "-i".to_string(),
                vm.ssh_key.to_string_lossy().into_owned(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "LogLevel=quiet".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
        }
    }

    pub fn close(&self) {
        self.channel.close();
    }

    async fn round_trip(&self, action: &str, data: Value) -> Result<Response, AgentError> {
        let mut exchange = self
            .channel
            .send(action, data, self.config.client.send_retry)
            .await?;
        let frame = exchange.next().await?;
        exchange.close();
        Ok(frame)
    }
}

fn rejected(action: &str, frame: Response) -> AgentError {
    AgentError::Rejected {
        action: action.to_string(),
        message: frame
            .err
            .unwrap_or_else(|| frame.data.to_string()),
    }
}

fn protocol(action: &str, error: impl ToString) -> AgentError {
    AgentError::Protocol {
        action: action.to_string(),
        message: error.to_string(),
    }
}
