// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Systems: the services of a development environment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::container::{
    is_annotation_value, Annotations, ANNOTATION_MANIFEST, ANNOTATION_SYSTEM, ANNOTATION_TYPE,
};
use crate::domain::runtime::{RunMode, RuntimeError, RunSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    #[serde(default = "default_tag")]
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Split `repo[:tag]`, keeping registry ports (`host:5000/repo`) intact.
    pub fn parse(name: &str) -> Self {
        match name.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => Self::new(repository, tag),
            _ => Self::new(name, default_tag()),
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub name: String,
    /// Identifier of the manifest that declared this system
    #[serde(default)]
    pub manifest_id: String,
    pub workdir: PathBuf,
    pub image: ImageRef,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub provision_steps: Vec<String>,
    /// Bind-mount the workdir into the container
    #[serde(default)]
    pub sync_files: bool,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Container ports to publish (`3000/tcp`)
    #[serde(default)]
    pub ports: Vec<String>,
    /// Set after the first successful provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned: Option<DateTime<Utc>>,
}

impl System {
    pub fn new(name: impl Into<String>, image: ImageRef, workdir: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            manifest_id: String::new(),
            workdir: workdir.as_ref().to_path_buf(),
            image,
            command: vec![],
            depends: vec![],
            provision_steps: vec![],
            sync_files: false,
            envs: BTreeMap::new(),
            ports: vec![],
            provisioned: None,
        }
    }

    /// Reject names that would not decode back from a container name.
    pub fn validate(&self) -> Result<(), SystemError> {
        if !is_annotation_value(&self.name) {
            return Err(SystemError::InvalidName {
                field: "system name",
                value: self.name.clone(),
            });
        }
        if !self.manifest_id.is_empty() && !is_annotation_value(&self.manifest_id) {
            return Err(SystemError::InvalidName {
                field: "manifest id",
                value: self.manifest_id.clone(),
            });
        }
        Ok(())
    }

    pub fn annotations(&self, kind: &str) -> Annotations {
        let mut annotations = Annotations::new()
            .with(ANNOTATION_TYPE, kind)
            .with(ANNOTATION_SYSTEM, self.name.as_str());
        if !self.manifest_id.is_empty() {
            annotations.insert(ANNOTATION_MANIFEST, self.manifest_id.as_str());
        }
        annotations
    }

    pub fn shell_spec(&self, namespace: &str, command: Vec<String>) -> RunSpec {
        self.run_spec(namespace, RunMode::Shell, command, vec![])
    }

    pub fn daemon_spec(&self, namespace: &str) -> RunSpec {
        self.run_spec(
            namespace,
            RunMode::Daemon,
            self.command.clone(),
            self.ports.clone(),
        )
    }

    fn run_spec(
        &self,
        namespace: &str,
        mode: RunMode,
        command: Vec<String>,
        ports: Vec<String>,
    ) -> RunSpec {
        let kind = match mode {
            RunMode::Shell => "shell",
            RunMode::Daemon => "daemon",
        };
        let mut annotations = self.annotations(kind);
        let name = annotations.encode(namespace);

        let env = self
            .envs
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .chain(annotations.envs())
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let workdir = self.workdir.to_string_lossy().into_owned();
        let binds = if self.sync_files {
            vec![format!("{}:{}", workdir, workdir)]
        } else {
            vec![]
        };

        RunSpec {
            image: self.image.name(),
            name,
            command,
            mode,
            env,
            working_dir: Some(workdir),
            binds,
            ports,
        }
    }
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Image {image} for system '{system}' is not available and pulling is disabled")]
    ImageNotAvailable { system: String, image: String },

    #[error("Provisioning command failed: {command}\n{output}")]
    RunCommand { command: String, output: String },

    #[error(
        "System '{system}' did not become available (container {container}, command `{command}`, exit code {exit_code})\n{log}"
    )]
    SystemRun {
        system: String,
        container: String,
        command: String,
        exit_code: i64,
        log: String,
    },

    #[error("Invalid {field} '{value}': use letters, digits, '-' and '.'")]
    InvalidName { field: &'static str, value: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn default_tag() -> String {
    "latest".to_string()
}
