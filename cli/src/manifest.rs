// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Systems file
//!
//! ```yaml
//! id: shop
//! systems:
//!   web:
//!     image: node:20
//!     command: [npm, start]
//!     provision: [npm install]
//!     ports: ["3000/tcp"]
//!     sync_files: true
//! ```
//!
//! Provisioning timestamps are kept next to the file in
//! `.berth/provisioned.yaml` so later invocations skip finished setup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use berth_core::domain::system::{ImageRef, System};

pub const DEFAULT_SYSTEMS_FILE: &str = "berth-systems.yaml";
const STATE_FILE: &str = ".berth/provisioned.yaml";

#[derive(Debug, Deserialize)]
struct SystemsFile {
    #[serde(default)]
    id: Option<String>,
    systems: BTreeMap<String, SystemEntry>,
}

#[derive(Debug, Deserialize)]
struct SystemEntry {
    image: String,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    provision: Vec<String>,
    #[serde(default)]
    sync_files: bool,
    #[serde(default)]
    envs: BTreeMap<String, String>,
    #[serde(default)]
    ports: Vec<String>,
}

#[derive(Debug)]
pub struct Manifest {
    pub id: String,
    pub path: PathBuf,
    pub systems: BTreeMap<String, System>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = std::fs::canonicalize(path.as_ref())
            .with_context(|| format!("Systems file {} not found", path.as_ref().display()))?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut manifest = Self::parse(&content, &path)?;
        manifest.restore_provisioned()?;
        Ok(manifest)
    }

    /// Parse a systems file located at `path` (used to resolve workdirs).
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let file: SystemsFile = serde_yaml::from_str(content)
            .with_context(|| format!("Invalid systems file {}", path.display()))?;
        let root = path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
        let id = file.id.unwrap_or_else(|| default_id(&root));

        let systems = file
            .systems
            .into_iter()
            .map(|(name, entry)| {
                let workdir = match entry.workdir {
                    Some(dir) if dir.is_absolute() => dir,
                    Some(dir) => root.join(dir),
                    None => root.clone(),
                };
                let mut system = System::new(name.as_str(), ImageRef::parse(&entry.image), workdir);
                system.manifest_id = id.clone();
                system.command = entry.command;
                system.depends = entry.depends;
                system.provision_steps = entry.provision;
                system.sync_files = entry.sync_files;
                system.envs = entry.envs;
                system.ports = entry.ports;
                system
                    .validate()
                    .with_context(|| format!("Invalid systems file {}", path.display()))?;
                Ok((name, system))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            systems,
        })
    }

    pub fn system(&self, name: &str) -> Result<System> {
        self.systems.get(name).cloned().with_context(|| {
            let known: Vec<_> = self.systems.keys().cloned().collect();
            format!("System '{}' not found (known: {})", name, known.join(", "))
        })
    }

    fn state_path(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(STATE_FILE)
    }

    fn restore_provisioned(&mut self) -> Result<()> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stamps: BTreeMap<String, DateTime<Utc>> = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid provisioning state {}", path.display()))?;
        for (name, stamp) in stamps {
            if let Some(system) = self.systems.get_mut(&name) {
                system.provisioned = Some(stamp);
            }
        }
        Ok(())
    }

    /// Persist the provisioning timestamp of `system`.
    pub fn record_provisioned(&mut self, system: &System) -> Result<()> {
        if let Some(known) = self.systems.get_mut(&system.name) {
            known.provisioned = system.provisioned;
        }

        let stamps: BTreeMap<&str, DateTime<Utc>> = self
            .systems
            .iter()
            .filter_map(|(name, system)| system.provisioned.map(|stamp| (name.as_str(), stamp)))
            .collect();
        let path = self.state_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, serde_yaml::to_string(&stamps)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Directory name reduced to characters that survive container naming
fn default_id(root: &Path) -> String {
    let id: String = root
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if id.is_empty() {
        "root".to_string()
    } else {
        id
    }
}
