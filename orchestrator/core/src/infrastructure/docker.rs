// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding as EnginePortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    KillContainerOptions, ListContainersOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    WaitContainerOptions,
};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::runtime::{
    ContainerEngine, ContainerInspect, ContainerSummary, ImageInfo, PortBinding, PortSummary,
    PullProgress, RunMode, RunSpec, RuntimeError,
};
use crate::domain::system::ImageRef;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Container engine backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result =
                Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(
                path,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            );

            result.map_err(|e| {
                RuntimeError::Connection(format!(
                    "{} ({}). Ensure Docker is running and the socket path is correct.",
                    e, path
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::Connection(format!(
                    "{}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self { docker })
    }

    /// Verify the Docker daemon is reachable
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn wait_exit(&self, id: &str) -> Result<(), RuntimeError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => {
                debug!("Container {} exited with {}", id, response.status_code);
                Ok(())
            }
            // Non-zero exits surface as an error; the code is read back by inspect.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                debug!("Container {} exited with {}", id, code);
                Ok(())
            }
            Some(Err(e)) => Err(map_error("wait", id, e)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn pull(&self, image: &str) -> BoxStream<'static, Result<PullProgress, RuntimeError>> {
        let image_ref = ImageRef::parse(image);
        let image = image.to_string();
        let docker = self.docker.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();

        tokio::spawn(async move {
            let options = CreateImageOptionsBuilder::new()
                .from_image(&image_ref.repository)
                .tag(&image_ref.tag)
                .build();
            let mut stream = docker.create_image(Some(options), None, None);
            while let Some(item) = stream.next().await {
                let item = item
                    .map(|info| PullProgress {
                        id: info.id,
                        status: info.status.unwrap_or_default(),
                    })
                    .map_err(|e| RuntimeError::Pull {
                        image: image.clone(),
                        message: e.to_string(),
                    });
                let failed = item.is_err();
                if tx.unbounded_send(item).is_err() || failed {
                    break;
                }
            }
        });

        rx.boxed()
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, RuntimeError> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| map_error("inspect_image", image, e))?;

        Ok(ImageInfo {
            id: inspect.id.unwrap_or_default(),
            repo_tags: inspect.repo_tags.unwrap_or_default(),
        })
    }

    async fn run(&self, spec: RunSpec) -> Result<String, RuntimeError> {
        let port_bindings: HashMap<String, Option<Vec<EnginePortBinding>>> = spec
            .ports
            .iter()
            .map(|port| {
                // Empty host port lets the engine pick a free one.
                let binding = EnginePortBinding {
                    host_ip: None,
                    host_port: Some(String::new()),
                };
                (port.clone(), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..HostConfig::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| map_error("create_container", &spec.name, e))?;
        let id = created.id;

        self.docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_error("start_container", &id, e))?;

        info!("Started container {} ({:?}) from {}", spec.name, spec.mode, spec.image);

        if spec.mode == RunMode::Shell {
            self.wait_exit(&id).await?;
        }

        Ok(id)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspect, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect_container", id, e))?;

        let state = inspect.state.unwrap_or_default();
        let config = inspect.config.unwrap_or_default();
        let network = inspect.network_settings.unwrap_or_default();

        let gateway = network
            .networks
            .as_ref()
            .and_then(|networks| {
                networks.values().find_map(|endpoint| {
                    endpoint
                        .gateway
                        .clone()
                        .filter(|gateway| !gateway.is_empty())
                })
            });

        let ports = network
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings.map(|bindings| {
                    bindings
                        .into_iter()
                        .map(|binding| PortBinding {
                            host_ip: binding.host_ip,
                            host_port: binding.host_port,
                        })
                        .collect()
                });
                (port, bindings)
            })
            .collect::<BTreeMap<_, _>>();

        Ok(ContainerInspect {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            name: inspect.name.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            gateway,
            ports,
        })
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let seconds = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(seconds).build()))
            .await
        {
            Err(e) if is_already_stopped(&e) => {
                debug!("Container {} was already stopped", id);
                Ok(())
            }
            result => result.map_err(|e| map_error("stop_container", id, e)),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
            .map_err(|e| map_error("kill_container", id, e))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::new().force(force).build()),
            )
            .await
            .map_err(|e| map_error("remove_container", id, e))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(all).build()))
            .await
            .map_err(|e| map_error("list_containers", "*", e))?;

        Ok(summaries
            .into_iter()
            .map(|summary| ContainerSummary {
                id: summary.id.unwrap_or_default(),
                names: summary.names.unwrap_or_default(),
                image: summary.image.unwrap_or_default(),
                status: summary.status.unwrap_or_default(),
                ports: summary
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|port| PortSummary {
                        private_port: port.private_port,
                        public_port: port.public_port,
                        ip: port.ip,
                        protocol: port
                            .typ
                            .map(|typ| typ.to_string())
                            .filter(|typ| !typ.is_empty())
                            .unwrap_or_else(|| "tcp".to_string()),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_error("logs", id, e))?;
            output.push_str(&chunk.to_string());
        }
        Ok(output)
    }
}

/// 304 Not Modified: the container is not running
fn is_already_stopped(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn map_error(operation: &'static str, target: &str, error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(target.to_string()),
        BollardError::SocketNotFoundError(path) => RuntimeError::Connection(path),
        other => RuntimeError::engine(operation, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_not_found() {
        let error = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: web".to_string(),
        };
        assert!(map_error("inspect_container", "web", error).is_not_found());
    }

    #[test]
    fn test_not_modified_means_already_stopped() {
        let stopped = BollardError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "is not running".to_string(),
        };
        assert!(is_already_stopped(&stopped));
        assert!(!is_already_stopped(&conflict));
    }

    #[test]
    fn test_server_error_keeps_operation() {
        let error = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        match map_error("stop_container", "web", error) {
            RuntimeError::Engine { operation, .. } => assert_eq!(operation, "stop_container"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
