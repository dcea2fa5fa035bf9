// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon-side subsystems
//!
//! The agent supervises three collaborators: the API listener, the managed
//! virtual machine and the load balancer. Only their interfaces live here;
//! the agent drives them in a fixed order.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::config::{BerthConfig, VmConfig};

#[derive(Debug, Error)]
pub enum SubsystemError {
    #[error("API listener failed: {0}")]
    Api(String),

    #[error("Virtual machine driver failed during {operation}: {message}")]
    Vm {
        operation: &'static str,
        message: String,
    },

    #[error("Load balancer failed: {0}")]
    Balancer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SubsystemError {
    pub fn vm(operation: &'static str, message: impl ToString) -> Self {
        Self::Vm {
            operation,
            message: message.to_string(),
        }
    }
}

/// What the driver needs to create the managed VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub ip: String,
    pub boot_disk: Option<PathBuf>,
    pub data_disk: Option<PathBuf>,
    /// Public half of the generated ssh key pair
    pub ssh_public_key: PathBuf,
}

impl VmSpec {
    pub fn from_config(vm: &VmConfig) -> Self {
        let mut public_key = vm.ssh_key.clone().into_os_string();
        public_key.push(".pub");
        Self {
            name: vm.name.clone(),
            ip: vm.ip.clone(),
            boot_disk: vm.boot_disk.clone(),
            data_disk: vm.data_disk.clone(),
            ssh_public_key: PathBuf::from(public_key),
        }
    }
}

#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn is_installed(&self, name: &str) -> Result<bool, SubsystemError>;
    async fn is_running(&self, name: &str) -> Result<bool, SubsystemError>;
    async fn install(&self, spec: &VmSpec) -> Result<(), SubsystemError>;
    async fn start(&self, name: &str) -> Result<(), SubsystemError>;
    async fn stop(&self, name: &str) -> Result<(), SubsystemError>;
    async fn configure_network(&self, name: &str, ip: &str) -> Result<(), SubsystemError>;
    async fn mount(&self, name: &str, host: &Path, guest: &str) -> Result<(), SubsystemError>;
    /// Capture the VM console into `dir`, returning the image path.
    async fn screenshot(&self, name: &str, dir: &Path) -> Result<PathBuf, SubsystemError>;
}

#[async_trait]
pub trait Balancer: Send + Sync {
    async fn install(&self, config: &BerthConfig) -> Result<(), SubsystemError>;
    async fn stop(&self) -> Result<(), SubsystemError>;
}

#[async_trait]
pub trait ApiListener: Send + Sync {
    async fn listen(&self, config: &BerthConfig) -> Result<(), SubsystemError>;
    async fn close(&self) -> Result<(), SubsystemError>;
}

/// Balancer used when load balancing is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBalancer;

#[async_trait]
impl Balancer for DisabledBalancer {
    async fn install(&self, _config: &BerthConfig) -> Result<(), SubsystemError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SubsystemError> {
        Ok(())
    }
}
