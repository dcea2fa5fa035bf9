// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent process lifecycle
//!
//! `not_running -> starting -> started -> stopping -> stopped`, with `error`
//! reachable from every active state. Status changes go to a single progress
//! observer; a new `start` replaces it and SIGUSR2 detaches it.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use berth_core::domain::config::BerthConfig;
use berth_core::domain::events::AgentEvent;
use berth_core::domain::progress::{AgentStatus, ProgressEvent, ProgressSink};
use berth_core::infrastructure::event_bus::EventBus;

use super::client::{AgentLifecycle, StartOutcome};
use super::{set_process_label, AgentError, DaemonServer, PidRecord};

/// How long `stop` waits for a running agent to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// State shared with the signal task
struct Lifecycle {
    observer: Mutex<ProgressSink>,
    stopping: AtomicBool,
    shutdown: Notify,
}

impl Lifecycle {
    fn relay(self: &Arc<Self>) -> ProgressSink {
        let lifecycle = Arc::clone(self);
        ProgressSink::new(move |event| lifecycle.notify(event))
    }

    fn notify(&self, event: ProgressEvent) {
        let observer = self.observer.lock().clone();
        observer.notify(event);
    }

    /// Ask a started agent to shut down; only the first request counts.
    fn request_stop(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.notify_one();
        true
    }
}

pub struct DaemonProcess {
    config: Mutex<BerthConfig>,
    server: DaemonServer,
    pid: Arc<dyn PidRecord>,
    events: EventBus,
    lifecycle: Arc<Lifecycle>,
    signals_installed: AtomicBool,
}

impl DaemonProcess {
    pub fn new(
        config: BerthConfig,
        server: DaemonServer,
        pid: Arc<dyn PidRecord>,
        events: EventBus,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            server,
            pid,
            events,
            lifecycle: Arc::new(Lifecycle {
                observer: Mutex::new(ProgressSink::noop()),
                stopping: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            signals_installed: AtomicBool::new(false),
        }
    }

    /// Configuration in effect, overrides included
    pub fn config(&self) -> BerthConfig {
        self.config.lock().clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.lifecycle.stopping.load(Ordering::SeqCst)
    }

    /// Trigger the graceful shutdown a termination signal would.
    pub fn request_stop(&self) -> bool {
        self.lifecycle.request_stop()
    }

    /// Replace the progress observer with a no-op sink.
    pub fn detach_observer(&self) {
        info!("Detaching agent progress observer");
        *self.lifecycle.observer.lock() = ProgressSink::noop();
    }

    /// Run the agent until it is asked to stop.
    ///
    /// Returns once the agent has shut down again, or immediately when
    /// another agent already holds the pid record.
    pub async fn run(
        &self,
        overrides: BTreeMap<String, Value>,
        progress: ProgressSink,
    ) -> Result<StartOutcome, AgentError> {
        *self.lifecycle.observer.lock() = progress;

        if self.pid.is_running() {
            let pid = self.pid.pid();
            self.change_status(AgentStatus::AlreadyRunning, pid, None);
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        self.change_status(AgentStatus::Starting, Some(std::process::id()), None);
        if let Err(e) = self.start_subsystems(&overrides).await {
            error!("Agent failed to start: {}", e);
            self.change_status(AgentStatus::Error, Some(std::process::id()), Some(e.to_string()));
            self.lifecycle.stopping.store(true, Ordering::SeqCst);
            self.gracefully_stop().await;
            return Err(e);
        }

        self.lifecycle.shutdown.notified().await;
        let code = self.gracefully_stop().await;
        Ok(StartOutcome::Stopped { code })
    }

    async fn start_subsystems(&self, overrides: &BTreeMap<String, Value>) -> Result<(), AgentError> {
        let config = self.config.lock().merge(overrides)?;
        *self.config.lock() = config.clone();

        set_process_label(&format!("{}-agent", config.namespace));
        self.install_signal_handlers()?;

        let pid = std::process::id();
        if let Err(e) = self.pid.update(pid) {
            warn!("Could not record agent pid {}: {}", pid, e);
        }

        self.server.start(&config, &self.lifecycle.relay()).await?;

        self.change_status(AgentStatus::Started, Some(pid), None);
        self.events.publish_agent_event(AgentEvent::Started {
            pid,
            started_at: Utc::now(),
        });
        info!("Agent started with pid {}", pid);
        Ok(())
    }

    /// Stop subsystems, drop the pid record and report the result.
    ///
    /// Returns the agent exit code: 0 on a clean shutdown, 1 otherwise.
    pub async fn gracefully_stop(&self) -> i32 {
        let pid = std::process::id();
        self.change_status(AgentStatus::Stopping, Some(pid), None);

        let config = self.config();
        let result = self.server.stop(&config, &self.lifecycle.relay()).await;

        if let Err(e) = self.pid.unlink() {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove agent pid record: {}", e);
            }
        }

        let code = match result {
            Ok(()) => {
                self.change_status(AgentStatus::Stopped, Some(pid), None);
                0
            }
            Err(e) => {
                error!("Agent stop error: {}", e);
                self.change_status(AgentStatus::Error, Some(pid), Some(e.to_string()));
                1
            }
        };
        self.events.publish_agent_event(AgentEvent::Stopped {
            pid,
            code,
            stopped_at: Utc::now(),
        });
        code
    }

    /// Terminate the agent recorded in the pid record.
    pub async fn stop(&self, progress: &ProgressSink) -> Result<(), AgentError> {
        if self.is_stopping() {
            return Ok(());
        }

        let pid = self.pid.pid();
        if !self.pid.is_running() {
            progress.notify(ProgressEvent::Status {
                status: AgentStatus::NotRunning,
                pid,
                data: None,
            });
            return Ok(());
        }

        progress.notify(ProgressEvent::Status {
            status: AgentStatus::Stopping,
            pid,
            data: None,
        });
        match self.pid.kill_and_wait(STOP_TIMEOUT).await {
            Ok(true) => {
                progress.notify(ProgressEvent::Status {
                    status: AgentStatus::Stopped,
                    pid,
                    data: None,
                });
                Ok(())
            }
            Ok(false) => Err(AgentError::Stop { pid }),
            Err(e) => {
                warn!("Could not signal agent process: {}", e);
                Err(AgentError::Stop { pid })
            }
        }
    }

    fn change_status(&self, status: AgentStatus, pid: Option<u32>, data: Option<String>) {
        info!("Agent status: {}", status);
        self.lifecycle.notify(ProgressEvent::Status { status, pid, data });
    }

    #[cfg(unix)]
    fn install_signal_handlers(&self) -> Result<(), AgentError> {
        use tokio::signal::unix::{signal, SignalKind};

        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut detach = signal(SignalKind::user_defined2())?;
        let lifecycle = Arc::clone(&self.lifecycle);

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = terminate.recv() => "SIGTERM",
                    _ = interrupt.recv() => "SIGINT",
                    _ = quit.recv() => "SIGQUIT",
                    _ = detach.recv() => {
                        info!("Clearing agent progress observer");
                        *lifecycle.observer.lock() = ProgressSink::noop();
                        continue;
                    }
                };
                if lifecycle.request_stop() {
                    info!("Agent received {}, shutting down", name);
                }
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self) -> Result<(), AgentError> {
        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let lifecycle = Arc::clone(&self.lifecycle);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if lifecycle.request_stop() {
                    info!("Agent received Ctrl+C, shutting down");
                }
            }
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentLifecycle for DaemonProcess {
    async fn start(
        &self,
        overrides: BTreeMap<String, Value>,
        progress: ProgressSink,
    ) -> Result<StartOutcome, AgentError> {
        self.run(overrides, progress).await
    }

    async fn stop(&self, progress: ProgressSink) -> Result<(), AgentError> {
        DaemonProcess::stop(self, &progress).await
    }
}
