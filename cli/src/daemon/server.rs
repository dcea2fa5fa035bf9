// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent subsystems
//!
//! Brings the API listener, the managed VM and the balancer up in that
//! order, and down in reverse.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};

use berth_core::domain::config::BerthConfig;
use berth_core::domain::progress::{ProgressEvent, ProgressSink};
use berth_core::domain::subsystem::{ApiListener, Balancer, SubsystemError, VmDriver, VmSpec};

use super::AgentError;

pub struct DaemonServer {
    api: Arc<dyn ApiListener>,
    vm: Arc<dyn VmDriver>,
    balancer: Arc<dyn Balancer>,
    /// Set when this process booted the VM
    vm_started: AtomicBool,
}

impl DaemonServer {
    pub fn new(api: Arc<dyn ApiListener>, vm: Arc<dyn VmDriver>, balancer: Arc<dyn Balancer>) -> Self {
        Self {
            api,
            vm,
            balancer,
            vm_started: AtomicBool::new(false),
        }
    }

    pub async fn start(&self, config: &BerthConfig, progress: &ProgressSink) -> Result<(), AgentError> {
        progress.notify(ProgressEvent::context("api", "starting"));
        self.api.listen(config).await?;

        if config.agent.requires_vm {
            self.install_vm(config, progress).await?;
            self.start_vm(config, progress).await?;
            self.mount_share(config, progress).await?;
        }

        if config.agent.balancer.enabled {
            progress.notify(ProgressEvent::context("balancer", "installing"));
            self.balancer.install(config).await?;
        }

        info!("Agent subsystems started");
        Ok(())
    }

    /// Stop every subsystem; the first failure is returned after all were tried.
    pub async fn stop(&self, config: &BerthConfig, progress: &ProgressSink) -> Result<(), AgentError> {
        let mut first_error: Option<AgentError> = None;
        let mut record = |result: Result<(), SubsystemError>, what: &str| {
            if let Err(e) = result {
                error!("Failed to stop {}: {}", what, e);
                first_error.get_or_insert(e.into());
            }
        };

        if config.agent.balancer.enabled {
            progress.notify(ProgressEvent::context("balancer", "stopping"));
            record(self.balancer.stop().await, "balancer");
        }

        if config.agent.requires_vm && self.vm_started.swap(false, Ordering::SeqCst) {
            progress.notify(ProgressEvent::context("vm", "stopping"));
            record(self.vm.stop(&config.agent.vm.name).await, "virtual machine");
        }

        progress.notify(ProgressEvent::context("api", "stopping"));
        record(self.api.close().await, "API listener");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn install_vm(&self, config: &BerthConfig, progress: &ProgressSink) -> Result<(), AgentError> {
        let vm = &config.agent.vm;
        if self.vm.is_installed(&vm.name).await? {
            return Ok(());
        }

        progress.notify(ProgressEvent::context("vm", "installing"));
        ensure_ssh_key(&vm.ssh_key).await?;
        self.vm.install(&VmSpec::from_config(vm)).await?;
        progress.notify(ProgressEvent::context("vm", "configuring network"));
        self.vm.configure_network(&vm.name, &vm.ip).await?;
        info!("Installed virtual machine {}", vm.name);
        Ok(())
    }

    async fn start_vm(&self, config: &BerthConfig, progress: &ProgressSink) -> Result<(), AgentError> {
        let vm = &config.agent.vm;
        if self.vm.is_running(&vm.name).await? {
            return Ok(());
        }

        progress.notify(ProgressEvent::context("vm", "starting"));
        let timeout = vm.start_timeout();
        match tokio::time::timeout(timeout, self.vm.start(&vm.name)).await {
            Ok(result) => result?,
            Err(_) => {
                let screenshot = match self.vm.screenshot(&vm.name, &vm.screenshot_dir).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!("Could not capture the VM screen: {}", e);
                        None
                    }
                };
                return Err(AgentError::VmStart {
                    name: vm.name.clone(),
                    timeout,
                    screenshot,
                });
            }
        }

        self.vm_started.store(true, Ordering::SeqCst);
        info!("Virtual machine {} is up", vm.name);
        Ok(())
    }

    async fn mount_share(&self, config: &BerthConfig, progress: &ProgressSink) -> Result<(), AgentError> {
        let vm = &config.agent.vm;
        let host = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        progress.notify(ProgressEvent::context("vm", "mounting shared folder"));
        self.vm.mount(&vm.name, &host, &vm.mount_point).await?;
        Ok(())
    }
}

/// Generate the VM ssh key pair unless it already exists.
async fn ensure_ssh_key(key: &Path) -> Result<(), AgentError> {
    if key.exists() {
        return Ok(());
    }
    if let Some(parent) = key.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!("Generating ssh key {}", key.display());
    let output = Command::new("ssh-keygen")
        .args(["-t", "rsa", "-b", "4096", "-N", "", "-q", "-f"])
        .arg(key)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SubsystemError::vm("ssh key generation", stderr.trim()).into());
    }
    Ok(())
}

/// Driver for hosts without a supported hypervisor
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedVmDriver;

impl UnsupportedVmDriver {
    fn unsupported(operation: &'static str) -> SubsystemError {
        SubsystemError::vm(
            operation,
            "no virtual machine driver is available on this host; set agent.requires_vm to false",
        )
    }
}

#[async_trait]
impl VmDriver for UnsupportedVmDriver {
    async fn is_installed(&self, _name: &str) -> Result<bool, SubsystemError> {
        Ok(false)
    }

    async fn is_running(&self, _name: &str) -> Result<bool, SubsystemError> {
        Ok(false)
    }

    async fn install(&self, _spec: &VmSpec) -> Result<(), SubsystemError> {
        Err(Self::unsupported("install"))
    }

    async fn start(&self, _name: &str) -> Result<(), SubsystemError> {
        Err(Self::unsupported("start"))
    }

    async fn stop(&self, _name: &str) -> Result<(), SubsystemError> {
        Ok(())
    }

    async fn configure_network(&self, _name: &str, _ip: &str) -> Result<(), SubsystemError> {
        Err(Self::unsupported("configure network"))
    }

    async fn mount(&self, _name: &str, _host: &Path, _guest: &str) -> Result<(), SubsystemError> {
        Err(Self::unsupported("mount"))
    }

    async fn screenshot(&self, _name: &str, _dir: &Path) -> Result<PathBuf, SubsystemError> {
        Err(Self::unsupported("screenshot"))
    }
}
