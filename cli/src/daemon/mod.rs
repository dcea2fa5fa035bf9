// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent daemon implementation
//!
//! Handles:
//! - PID file management (singleton enforcement)
//! - The daemon lifecycle and its subsystems
//! - The control channel and client used by every other command

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

pub mod channel;
pub mod client;
pub mod error;
pub mod process;
pub mod server;

pub use channel::{ChannelError, ControlChannel, Exchange, HttpClient};
pub use client::{AgentLifecycle, ControlClient, DetachedAgent, SshOptions, StartOutcome, StatusSnapshot};
pub use error::AgentError;
pub use process::DaemonProcess;
pub use server::{DaemonServer, UnsupportedVmDriver};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Liveness record of the agent daemon
#[async_trait]
pub trait PidRecord: Send + Sync {
    /// Recorded pid, if any
    fn pid(&self) -> Option<u32>;

    /// Whether the recorded process is alive
    fn is_running(&self) -> bool;

    fn update(&self, pid: u32) -> std::io::Result<()>;

    /// Terminate the recorded process and wait until it is gone.
    ///
    /// Returns `false` if it was still alive when `timeout` elapsed.
    async fn kill_and_wait(&self, timeout: Duration) -> std::io::Result<bool>;

    fn unlink(&self) -> std::io::Result<()>;
}

/// PID file on disk
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PidRecord for PidFile {
    fn pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok())
            // kill(2) treats 0 and negative pids as process groups
            .filter(|pid| *pid != 0 && i32::try_from(*pid).is_ok())
    }

    fn is_running(&self) -> bool {
        let running = self.pid().is_some_and(process_exists);
        debug!("Agent pid file {} running: {}", self.path.display(), running);
        running
    }

    fn update(&self, pid: u32) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, pid.to_string())
    }

    async fn kill_and_wait(&self, timeout: Duration) -> std::io::Result<bool> {
        let Some(pid) = self.pid() else {
            return Ok(true);
        };
        if !process_exists(pid) {
            return Ok(true);
        }

        info!("Sending SIGTERM to agent process {}", pid);
        send_terminate(pid)?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !process_exists(pid) {
                return Ok(true);
            }
            sleep(KILL_POLL_INTERVAL).await;
        }
        Ok(!process_exists(pid))
    }

    fn unlink(&self) -> std::io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

fn process_exists(_pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(_pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        false
    }
}

fn send_terminate(_pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(_pid as i32, libc::SIGTERM) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ))
    }
}

/// Label the current process so the agent is recognisable in `ps`.
pub(crate) fn set_process_label(label: &str) {
    #[cfg(target_os = "linux")]
    {
        // The kernel keeps at most 15 bytes plus NUL.
        let mut bytes: Vec<u8> = label.bytes().filter(|b| *b != 0).take(15).collect();
        bytes.push(0);
        unsafe {
            libc::prctl(libc::PR_SET_NAME, bytes.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        debug!("Process label '{}' not applied on this platform", label);
    }
}
