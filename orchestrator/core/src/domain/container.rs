// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container identity and normalized engine state
//!
//! Containers carry their system metadata inside the container name:
//!
//! ```text
//! {namespace}_{key1}.{value1}_{key2}.{value2}...
//! ```
//!
//! Keys must not contain `_` or `.`, values must not contain `_`. Values that
//! come from users (system names, manifest ids) are checked with
//! [`is_annotation_value`] before they are encoded.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::domain::runtime::{ContainerInspect, ContainerSummary, PortBinding, PortSummary};

/// Generated short unique id
pub const ANNOTATION_UID: &str = "uid";
/// Manifest identifier of the owning project
pub const ANNOTATION_MANIFEST: &str = "mid";
/// Type discriminator (`daemon`, `shell`, ...)
pub const ANNOTATION_TYPE: &str = "type";
/// Owning system name
pub const ANNOTATION_SYSTEM: &str = "sys";

/// Prefix of environment variables derived from annotations
pub const ANNOTATION_ENV_PREFIX: &str = "AZK_";

const UID_LEN: usize = 10;

static EXIT_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Exited \((-?\d+)\)").expect("valid exit code regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations(BTreeMap<String, String>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn uid(&self) -> Option<&str> {
        self.get(ANNOTATION_UID)
    }

    pub fn kind(&self) -> Option<&str> {
        self.get(ANNOTATION_TYPE)
    }

    pub fn system(&self) -> Option<&str> {
        self.get(ANNOTATION_SYSTEM)
    }

    pub fn manifest_id(&self) -> Option<&str> {
        self.get(ANNOTATION_MANIFEST)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize into a container name.
    ///
    /// Assigns a generated uid when absent; the uid is stored so later encodes
    /// of the same instance produce the same name.
    pub fn encode(&mut self, namespace: &str) -> String {
        if !self.0.contains_key(ANNOTATION_UID) {
            let uid = uuid::Uuid::new_v4().simple().to_string();
            self.insert(ANNOTATION_UID, &uid[..UID_LEN]);
        }

        std::iter::once(namespace.to_string())
            .chain(self.0.iter().map(|(key, value)| format!("{}.{}", key, value)))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Recover annotations from a container name, ignoring any leading path
    /// (engines report names as `/name`) and the namespace segment.
    pub fn decode(name: &str) -> Self {
        let name = name.rsplit('/').next().unwrap_or(name);
        let mut annotations = Self::new();
        for segment in name.split('_').skip(1) {
            match segment.split_once('.') {
                Some((key, value)) => annotations.insert(key, value),
                None if !segment.is_empty() => annotations.insert(segment, ""),
                None => {}
            }
        }
        annotations
    }

    /// `AZK_<KEY>=value` pairs; the type discriminator becomes `AZK_ENV`.
    pub fn envs(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(key, value)| {
                let key = if key == ANNOTATION_TYPE { "env" } else { key.as_str() };
                (
                    format!("{}{}", ANNOTATION_ENV_PREFIX, key.to_uppercase()),
                    value.clone(),
                )
            })
            .collect()
    }
}

impl FromIterator<(String, String)> for Annotations {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Whether `value` survives an encode/decode round trip and is legal in a
/// container name: ASCII alphanumerics, `-` and `.`, starting alphanumeric.
pub fn is_annotation_value(value: &str) -> bool {
    value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Namespace segment of a container name.
pub fn namespace_of(name: &str) -> &str {
    let name = name.rsplit('/').next().unwrap_or(name);
    name.split('_').next().unwrap_or(name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub running: bool,
    pub paused: bool,
    pub exit_code: i64,
}

impl ContainerState {
    /// Map an engine status line (`Up 2 hours`, `Exited (137) 3 minutes ago`).
    pub fn parse(status: &str) -> Self {
        let running = status.starts_with("Up");
        let paused = running && status.ends_with("(Paused)");

        let exit_code = if status.contains("Exited") {
            EXIT_CODE
                .captures(status)
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or_default()
        } else {
            0
        };

        Self {
            running,
            paused,
            exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAccess {
    /// Container-side port
    pub name: String,
    pub protocol: String,
    pub gateway: Option<String>,
    /// Published host port
    pub port: Option<u16>,
}

/// Published ports keyed by container-side port
pub type AccessMap = BTreeMap<String, PortAccess>;

/// Access map from inspect bindings (`"80/tcp" -> [HostPort]`).
pub fn access_from_bindings(
    bindings: &BTreeMap<String, Option<Vec<PortBinding>>>,
    gateway: Option<&str>,
) -> AccessMap {
    bindings
        .iter()
        .filter_map(|(key, binding)| {
            let first = binding.as_ref()?.first()?;
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            Some((
                port.to_string(),
                PortAccess {
                    name: port.to_string(),
                    protocol: protocol.to_string(),
                    gateway: gateway.map(str::to_string),
                    port: first.host_port.as_deref().and_then(|p| p.parse().ok()),
                },
            ))
        })
        .collect()
}

/// Access map from list summaries.
pub fn access_from_ports(ports: &[PortSummary]) -> AccessMap {
    ports
        .iter()
        .map(|port| {
            let name = port.private_port.to_string();
            (
                name.clone(),
                PortAccess {
                    name,
                    protocol: port.protocol.clone(),
                    gateway: port.ip.clone(),
                    port: port.public_port,
                },
            )
        })
        .collect()
}

/// A container normalized from engine data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub annotations: Annotations,
    pub access: AccessMap,
    pub state: ContainerState,
}

impl Container {
    pub fn from_inspect(data: ContainerInspect) -> Self {
        let access = access_from_bindings(&data.ports, data.gateway.as_deref());
        Self {
            annotations: Annotations::decode(&data.name),
            access,
            state: ContainerState {
                running: data.running,
                paused: data.paused,
                exit_code: data.exit_code,
            },
            id: data.id,
            name: data.name,
            image: data.image,
            command: data.cmd,
        }
    }

    pub fn from_summary(data: ContainerSummary) -> Self {
        let name = data.names.first().cloned().unwrap_or_default();
        Self {
            annotations: Annotations::decode(&name),
            access: access_from_ports(&data.ports),
            state: ContainerState::parse(&data.status),
            id: data.id,
            name,
            image: data.image,
            command: vec![],
        }
    }

    /// First published TCP port, if any
    pub fn tcp_access(&self) -> Option<&PortAccess> {
        self.access.values().find(|port| port.protocol == "tcp")
    }
}
