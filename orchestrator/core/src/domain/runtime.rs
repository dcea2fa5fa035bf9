// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Run to completion; `run` returns once the container exits
    Shell,
    /// Start detached; `run` returns once the container is started
    Daemon,
}

/// Everything the engine needs to create and start one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub mode: RunMode,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// `host:guest[:ro]` bind mounts
    #[serde(default)]
    pub binds: Vec<String>,
    /// Container ports to publish on random host ports (`80/tcp`)
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub ip: Option<String>,
    pub protocol: String,
}

/// Raw inspect data as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub running: bool,
    pub paused: bool,
    pub exit_code: i64,
    pub gateway: Option<String>,
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

/// Raw list entry as reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    /// Human status line (`Up 2 hours`)
    pub status: String,
    pub ports: Vec<PortSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// One line of pull output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cannot connect to container engine: {0}")]
    Connection(String),
    #[error("Failed to pull image {image}: {message}")]
    Pull { image: String, message: String },
    #[error("Container engine {operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    pub fn engine(operation: &'static str, message: impl ToString) -> Self {
        Self::Engine {
            operation,
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Low-level container engine capability.
///
/// Implementations report raw engine data; normalization happens in
/// `ContainerRuntime`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn pull(&self, image: &str) -> BoxStream<'static, Result<PullProgress, RuntimeError>>;
    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, RuntimeError>;
    async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError>;
    async fn inspect(&self, id: &str) -> Result<ContainerInspect, RuntimeError>;
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;
    async fn logs(&self, id: &str) -> Result<String, RuntimeError>;
}
