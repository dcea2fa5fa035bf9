// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory container engine
//!
//! Scriptable stand-in for the Docker daemon. Records every call so callers
//! can assert on ordering.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::runtime::{
    ContainerEngine, ContainerInspect, ContainerSummary, ImageInfo, PortBinding, PortSummary,
    PullProgress, RunMode, RunSpec, RuntimeError,
};

const FIRST_HOST_PORT: u16 = 32768;

#[derive(Default)]
struct EngineState {
    images: BTreeMap<String, ImageInfo>,
    containers: BTreeMap<String, ContainerInspect>,
    summaries: Vec<ContainerSummary>,
    runs: Vec<RunSpec>,
    calls: Vec<String>,
    failures: HashMap<String, RuntimeError>,
    shell_exit_codes: VecDeque<i64>,
    daemon_exit_code: Option<i64>,
    logs: BTreeMap<String, String>,
    default_logs: String,
    published_port: Option<u16>,
    gateway: Option<String>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        let engine = Self::default();
        engine.state.lock().gateway = Some("127.0.0.1".to_string());
        engine
    }

    pub fn add_image(&self, image: &str) {
        let mut state = self.state.lock();
        let id = format!("sha256:{:04}", state.images.len());
        state.images.insert(
            image.to_string(),
            ImageInfo {
                id,
                repo_tags: vec![image.to_string()],
            },
        );
    }

    pub fn insert_container(&self, inspect: ContainerInspect) {
        self.state
            .lock()
            .containers
            .insert(inspect.id.clone(), inspect);
    }

    /// Raw list entry reported next to the containers this engine created
    pub fn add_summary(&self, summary: ContainerSummary) {
        self.state.lock().summaries.push(summary);
    }

    /// Fail the next call of `operation` (`run`, `inspect`, `pull`, ...)
    pub fn fail_next(&self, operation: &str, error: RuntimeError) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), error);
    }

    /// Exit code of the next shell-mode run; unscripted runs exit 0
    pub fn push_shell_exit(&self, code: i64) {
        self.state.lock().shell_exit_codes.push_back(code);
    }

    /// Daemon-mode containers exit immediately with `code` instead of running
    pub fn set_daemon_exit(&self, code: Option<i64>) {
        self.state.lock().daemon_exit_code = code;
    }

    /// Host port assigned to every published container port
    pub fn set_published_port(&self, port: u16) {
        self.state.lock().published_port = Some(port);
    }

    pub fn set_gateway(&self, gateway: Option<&str>) {
        self.state.lock().gateway = gateway.map(str::to_string);
    }

    pub fn set_logs(&self, id: &str, logs: &str) {
        self.state.lock().logs.insert(id.to_string(), logs.to_string());
    }

    pub fn set_default_logs(&self, logs: &str) {
        self.state.lock().default_logs = logs.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.state.lock().runs.clone()
    }

    pub fn container(&self, id: &str) -> Option<ContainerInspect> {
        self.state.lock().containers.get(id).cloned()
    }

    fn enter(&self, operation: &str, target: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", operation, target));
        match state.failures.remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Docker answers 304/409 when stopping or killing an exited container.
    fn halt(&self, operation: &'static str, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !container.running {
            return Err(RuntimeError::engine(
                operation,
                format!("container {} is not running", id),
            ));
        }
        container.running = false;
        Ok(())
    }
}

fn status_line(inspect: &ContainerInspect) -> String {
    match (inspect.running, inspect.paused) {
        (true, true) => "Up 1 second (Paused)".to_string(),
        (true, false) => "Up 1 second".to_string(),
        (false, _) => format!("Exited ({}) 1 second ago", inspect.exit_code),
    }
}

fn summary_of(inspect: &ContainerInspect) -> ContainerSummary {
    let ports = inspect
        .ports
        .iter()
        .filter_map(|(key, bindings)| {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let binding = bindings.as_ref()?.first()?;
            Some(PortSummary {
                private_port: port.parse().ok()?,
                public_port: binding.host_port.as_deref().and_then(|p| p.parse().ok()),
                ip: binding.host_ip.clone(),
                protocol: protocol.to_string(),
            })
        })
        .collect();

    ContainerSummary {
        id: inspect.id.clone(),
        names: vec![inspect.name.clone()],
        image: inspect.image.clone(),
        status: status_line(inspect),
        ports,
    }
}

#[async_trait]
impl ContainerEngine for InMemoryEngine {
    fn pull(&self, image: &str) -> BoxStream<'static, Result<PullProgress, RuntimeError>> {
        if let Err(error) = self.enter("pull", image) {
            return stream::iter(vec![Err(error)]).boxed();
        }
        self.add_image(image);

        let layer = Some("layer0".to_string());
        stream::iter(vec![
            Ok(PullProgress {
                id: layer.clone(),
                status: "Downloading".to_string(),
            }),
            Ok(PullProgress {
                id: layer,
                status: "Pull complete".to_string(),
            }),
        ])
        .boxed()
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, RuntimeError> {
        self.enter("inspect_image", image)?;
        self.state
            .lock()
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(image.to_string()))
    }

    async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError> {
        self.enter("run", &spec.image)?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);

        let (running, exit_code) = match spec.mode {
            RunMode::Shell => (false, state.shell_exit_codes.pop_front().unwrap_or(0)),
            RunMode::Daemon => match state.daemon_exit_code {
                Some(code) => (false, code),
                None => (true, 0),
            },
        };

        let base_port = state.published_port;
        let ports = spec
            .ports
            .iter()
            .enumerate()
            .map(|(index, port)| {
                let host_port = base_port.unwrap_or(FIRST_HOST_PORT + index as u16);
                let binding = PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                };
                (port.clone(), Some(vec![binding]))
            })
            .collect();

        let inspect = ContainerInspect {
            id: id.clone(),
            name: format!("/{}", spec.name),
            image: spec.image.clone(),
            cmd: spec.command.clone(),
            running,
            paused: false,
            exit_code,
            gateway: state.gateway.clone(),
            ports,
        };
        state.containers.insert(id.clone(), inspect);
        state.runs.push(spec);
        Ok(id)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspect, RuntimeError> {
        self.enter("inspect", id)?;
        self.state
            .lock()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.enter("stop", id)?;
        self.halt("stop", id)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter("kill", id)?;
        self.halt("kill", id)
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.enter("remove", id)?;
        let mut state = self.state.lock();
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.enter("list", if all { "all" } else { "running" })?;
        let state = self.state.lock();
        let listed = state
            .containers
            .values()
            .filter(|inspect| all || inspect.running)
            .map(summary_of)
            .chain(state.summaries.iter().cloned())
            .collect();
        Ok(listed)
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        self.enter("logs", id)?;
        let state = self.state.lock();
        Ok(state
            .logs
            .get(id)
            .cloned()
            .unwrap_or_else(|| state.default_logs.clone()))
    }
}
