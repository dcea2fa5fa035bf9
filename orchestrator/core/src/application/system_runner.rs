// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! System Runner
//!
//! Drives the provision/run/stop lifecycle of a system's containers.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrates `ContainerRuntime` calls for one system at a
//!   time and turns engine outcomes into diagnostic errors

use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::config::BerthConfig;
use crate::domain::container::Container;
use crate::domain::progress::{ProgressEvent, ProgressSink};
use crate::domain::runtime::{ImageInfo, RuntimeError};
use crate::domain::system::{System, SystemError};
use crate::infrastructure::net::wait_service;
use crate::infrastructure::runtime::ContainerRuntime;

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Run the steps even if the system was provisioned before
    pub force: bool,
    pub image_pull: bool,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            force: false,
            image_pull: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Remove the container once it exited
    pub remove: bool,
    pub image_pull: bool,
    /// Collect the container output into [`ShellResult::output`]
    pub capture_output: bool,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            remove: false,
            image_pull: true,
            capture_output: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub image_pull: bool,
    pub provision_force: bool,
    /// Availability attempts; falls back to `docker.run.retry`
    pub retry: Option<u32>,
    /// Bound per availability attempt; falls back to `docker.run.timeout_ms`
    pub timeout: Option<Duration>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            image_pull: true,
            provision_force: false,
            retry: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopOptions {
    pub kill: bool,
    pub remove: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            kill: false,
            remove: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellResult {
    pub exit_code: i64,
    pub container_id: String,
    pub removed: bool,
    pub output: Option<String>,
}

pub struct SystemRunner {
    runtime: ContainerRuntime,
    config: BerthConfig,
}

impl SystemRunner {
    pub fn new(runtime: ContainerRuntime, config: BerthConfig) -> Self {
        Self { runtime, config }
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    /// Run the provision steps once; returns whether anything ran.
    pub async fn run_provision(
        &self,
        system: &mut System,
        options: ProvisionOptions,
        progress: &ProgressSink,
    ) -> Result<bool, SystemError> {
        if system.provision_steps.is_empty() {
            return Ok(false);
        }
        if system.provisioned.is_some() && !options.force {
            debug!("System {} already provisioned", system.name);
            return Ok(false);
        }

        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("( {} )", system.provision_steps.join("; ")),
        ];

        progress.notify(ProgressEvent::Provision {
            system: system.name.clone(),
        });

        let shell = ShellOptions {
            remove: false,
            image_pull: options.image_pull,
            capture_output: true,
        };
        let result = self
            .run_shell(system, command.clone(), shell, progress)
            .await?;

        if result.exit_code != 0 {
            return Err(SystemError::RunCommand {
                command: command.join(" "),
                output: result.output.unwrap_or_default(),
            });
        }

        system.provisioned = Some(Utc::now());
        info!("Provisioned system {}", system.name);
        Ok(true)
    }

    pub async fn run_shell(
        &self,
        system: &System,
        command: Vec<String>,
        options: ShellOptions,
        progress: &ProgressSink,
    ) -> Result<ShellResult, SystemError> {
        system.validate()?;
        self.check_image(system, options.image_pull, progress).await?;

        let spec = system.shell_spec(&self.config.namespace, command);
        let id = self.runtime.run(spec).await?;
        let container = self.runtime.inspect(&id).await?;

        let output = if options.capture_output {
            Some(self.runtime.logs(&id).await?)
        } else {
            None
        };

        if options.remove {
            self.runtime.remove(&container, false).await?;
        }

        Ok(ShellResult {
            exit_code: container.state.exit_code,
            container_id: container.id,
            removed: options.remove,
            output,
        })
    }

    /// Start the system detached and wait until its first TCP port answers.
    pub async fn run_daemon(
        &self,
        system: &mut System,
        options: DaemonOptions,
        progress: &ProgressSink,
    ) -> Result<Container, SystemError> {
        system.validate()?;
        self.check_image(system, options.image_pull, progress).await?;

        let provision = ProvisionOptions {
            force: options.provision_force,
            // The image was just checked
            image_pull: false,
        };
        self.run_provision(system, provision, progress).await?;

        let spec = system.daemon_spec(&self.config.namespace);
        let id = self.runtime.run(spec).await?;
        let container = self.runtime.inspect(&id).await?;

        if let Some(access) = container.tcp_access().cloned() {
            let host = if self.config.agent.requires_vm {
                Some(self.config.agent.vm.ip.clone())
            } else {
                access.gateway.clone()
            };

            let retry = options.retry.unwrap_or(self.config.docker.run.retry);
            let timeout = options
                .timeout
                .unwrap_or_else(|| self.config.docker.run.timeout());

            match (host, access.port) {
                (Some(host), Some(port)) => {
                    progress.notify(ProgressEvent::Wait {
                        system: system.name.clone(),
                        host: host.clone(),
                        port,
                    });
                    self.wait_available(system, &container, &host, port, retry, timeout)
                        .await?;
                }
                _ => warn!(
                    "System {} publishes {} without a reachable address, skipping wait",
                    system.name, access.name
                ),
            }
        }

        Ok(container)
    }

    /// Stop instances last-first; with no instances given, stops every
    /// instance the system currently has. Exited instances are only removed.
    pub async fn stop(
        &self,
        system: &System,
        mut instances: Vec<Container>,
        options: StopOptions,
        progress: &ProgressSink,
    ) -> Result<(), SystemError> {
        if instances.is_empty() {
            instances = self.instances(system).await?;
        }

        let timeout = Duration::from_secs(self.config.docker.stop_timeout);
        while let Some(container) = instances.pop() {
            if !container.state.running {
                debug!("Container {} already exited", container.id);
            } else if options.kill {
                progress.notify(ProgressEvent::KillService {
                    system: system.name.clone(),
                });
                self.runtime.kill(&container).await?;
            } else {
                progress.notify(ProgressEvent::StopService {
                    system: system.name.clone(),
                });
                self.runtime.stop(&container, timeout).await?;
            }
            progress.notify(ProgressEvent::Stopped {
                id: container.id.clone(),
            });

            if options.remove {
                self.runtime.remove(&container, false).await?;
            }
        }
        Ok(())
    }

    /// Daemon containers of this system, running or not
    pub async fn instances(&self, system: &System) -> Result<Vec<Container>, SystemError> {
        system.validate()?;
        let containers = self.runtime.list_containers(true).await?;
        Ok(containers
            .into_iter()
            .filter(|container| {
                container.annotations.system() == Some(system.name.as_str())
                    && container.annotations.kind() == Some("daemon")
                    && (system.manifest_id.is_empty()
                        || container.annotations.manifest_id() == Some(system.manifest_id.as_str()))
            })
            .collect())
    }

    async fn wait_available(
        &self,
        system: &System,
        container: &Container,
        host: &str,
        port: u16,
        retry: u32,
        timeout: Duration,
    ) -> Result<(), SystemError> {
        let runtime = &self.runtime;
        let id = container.id.as_str();
        let running = wait_service(host, port, retry, timeout, || async move {
            match runtime.find_container(id).await {
                Ok(Some(container)) => container.state.running,
                Ok(None) => false,
                Err(e) => {
                    warn!("Cannot inspect container {}: {}", id, e);
                    false
                }
            }
        })
        .await;

        if running {
            return Ok(());
        }

        counter!("berth_availability_failures_total").increment(1);
        let data = self.runtime.inspect(id).await?;
        let log = self.runtime.logs(id).await?;
        Err(SystemError::SystemRun {
            system: system.name.clone(),
            container: data.id,
            command: data.command.join(" "),
            exit_code: data.state.exit_code,
            log,
        })
    }

    async fn check_image(
        &self,
        system: &System,
        image_pull: bool,
        progress: &ProgressSink,
    ) -> Result<ImageInfo, SystemError> {
        let image = system.image.name();

        if image_pull {
            let mut stream = self.runtime.pull(&image);
            while let Some(event) = stream.next().await {
                let event = event?;
                progress.notify(ProgressEvent::Pull {
                    system: system.name.clone(),
                    id: event.id,
                    status: event.status,
                });
            }
            return self
                .runtime
                .find_image(&image)
                .await?
                .ok_or_else(|| RuntimeError::NotFound(image).into());
        }

        self.runtime
            .find_image(&image)
            .await?
            .ok_or_else(|| SystemError::ImageNotAvailable {
                system: system.name.clone(),
                image,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::system::ImageRef;
    use crate::domain::tracker::DisabledTracker;
    use crate::infrastructure::memory_engine::InMemoryEngine;
    use std::sync::Arc;

    fn runner(engine: &Arc<InMemoryEngine>) -> SystemRunner {
        let runtime = ContainerRuntime::new(engine.clone(), Arc::new(DisabledTracker), "berth");
        let mut config = BerthConfig::default();
        config.agent.requires_vm = false;
        SystemRunner::new(runtime, config)
    }

    #[tokio::test]
    async fn test_missing_image_without_pull() {
        let engine = Arc::new(InMemoryEngine::new());
        let runner = runner(&engine);
        let system = System::new("web", ImageRef::new("node", "20"), "/src/web");

        let options = ShellOptions {
            image_pull: false,
            ..ShellOptions::default()
        };
        let err = runner
            .run_shell(&system, vec!["ls".to_string()], options, &ProgressSink::noop())
            .await
            .unwrap_err();

        match err {
            SystemError::ImageNotAvailable { system, image } => {
                assert_eq!(system, "web");
                assert_eq!(image, "node:20");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_underscore_system_name_is_rejected_before_running() {
        let engine = Arc::new(InMemoryEngine::new());
        let runner = runner(&engine);
        let mut system = System::new("my_api", ImageRef::new("node", "20"), "/src/api");

        let err = runner
            .run_daemon(&mut system, DaemonOptions::default(), &ProgressSink::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, SystemError::InvalidName { .. }));
        assert!(runner.instances(&system).await.is_err());
        assert!(engine.runs().is_empty());
    }

    #[tokio::test]
    async fn test_pull_progress_is_tagged_with_system() {
        let engine = Arc::new(InMemoryEngine::new());
        let runner = runner(&engine);
        let system = System::new("web", ImageRef::new("node", "20"), "/src/web");
        let (sink, mut rx) = ProgressSink::channel();

        let result = runner
            .run_shell(&system, vec!["true".to_string()], ShellOptions::default(), &sink)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);

        match rx.recv().await {
            Some(ProgressEvent::Pull { system, .. }) => assert_eq!(system, "web"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
