// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Configuration Context
//
// Typed configuration for the berth CLI and agent daemon:
// - Filesystem paths (API socket, pid file, ssh keys)
// - Container engine connection and run/availability tuning
// - Agent settings (managed VM, balancer, recorded override keys)
//
// Every leaf is also addressable by a colon-separated key such as
// `agent:vm:ip`. `merge` returns an updated context instead of mutating a
// shared store, and records each applied key under `agent:config_keys`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Key under which applied override keys are accumulated.
pub const CONFIG_KEYS_KEY: &str = "agent:config_keys";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration key '{0}'")]
    InvalidKey(String),
    #[error("Value for '{key}' does not fit the configuration schema: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BerthConfig {
    /// Prefix for container names and the daemon process label
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Unix socket served by the agent API listener
    #[serde(default = "default_api_socket")]
    pub api_socket: PathBuf,

    /// Pid file of the running agent
    #[serde(default = "default_agent_pid")]
    pub agent_pid: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Path to the engine socket. None = local defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    #[serde(default)]
    pub run: RunConfig,

    /// Seconds the engine waits before killing on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Availability attempts after a daemon container starts
    #[serde(default = "default_run_retry")]
    pub retry: u32,

    /// Bound for a single availability attempt, in milliseconds
    #[serde(default = "default_run_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Whether containers run inside a managed virtual machine
    #[serde(default = "default_requires_vm")]
    pub requires_vm: bool,

    /// Keys applied by `merge`, kept for diagnostics
    #[serde(default)]
    pub config_keys: Vec<String>,

    #[serde(default)]
    pub vm: VmConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default = "default_vm_name")]
    pub name: String,

    #[serde(default = "default_vm_ip")]
    pub ip: String,

    #[serde(default = "default_vm_user")]
    pub user: String,

    /// Private key used to reach the VM. Generated on first install
    #[serde(default = "default_ssh_key")]
    pub ssh_key: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_disk: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_disk: Option<PathBuf>,

    #[serde(default = "default_vm_start_timeout")]
    pub start_timeout_secs: u64,

    /// Guest path where the host share is mounted
    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    /// Where screenshots of a VM that failed to boot are written
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Extra attempts for a control channel send whose connect failed
    #[serde(default)]
    pub send_retry: u32,
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            paths: PathsConfig::default(),
            docker: DockerConfig::default(),
            agent: AgentConfig::default(),
            tracking: TrackingConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            api_socket: default_api_socket(),
            agent_pid: default_agent_pid(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            run: RunConfig::default(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retry: default_run_retry(),
            timeout_ms: default_run_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            requires_vm: default_requires_vm(),
            config_keys: vec![],
            vm: VmConfig::default(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: default_vm_name(),
            ip: default_vm_ip(),
            user: default_vm_user(),
            ssh_key: default_ssh_key(),
            boot_disk: None,
            data_disk: None,
            start_timeout_secs: default_vm_start_timeout(),
            mount_point: default_mount_point(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl VmConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

impl BerthConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. BERTH_CONFIG_PATH environment variable
    /// 2. ./berth.yaml (working directory)
    /// 3. ~/.berth/config.yaml (user home)
    /// 4. /etc/berth/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BERTH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./berth.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".berth").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/berth/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::debug!("No configuration file found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BERTH_REQUIRES_VM") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => self.agent.requires_vm = true,
                "false" | "0" | "no" | "off" => self.agent.requires_vm = false,
                _ => {
                    tracing::warn!(
                        "Invalid value for BERTH_REQUIRES_VM: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
        if let Ok(val) = std::env::var("BERTH_NAMESPACE") {
            self.namespace = val;
        }
        if let Ok(val) = std::env::var("BERTH_API_SOCKET") {
            self.paths.api_socket = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("BERTH_DOCKER_SOCKET") {
            self.docker.socket_path = Some(val);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::Invalid("namespace cannot be empty".to_string()));
        }
        // `_` and `.` separate annotations inside container names
        if self.namespace.contains(['_', '.', '/']) {
            return Err(ConfigError::Invalid(format!(
                "namespace '{}' must not contain '_', '.' or '/'",
                self.namespace
            )));
        }
        if self.paths.api_socket.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.api_socket cannot be empty".to_string()));
        }
        if self.paths.agent_pid.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.agent_pid cannot be empty".to_string()));
        }
        if self.docker.run.retry == 0 {
            return Err(ConfigError::Invalid("docker.run.retry must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Read any leaf by colon-separated key
    pub fn get(&self, key: &str) -> Option<Value> {
        let tree = serde_json::to_value(self).ok()?;
        key.split(':')
            .try_fold(&tree, |node, segment| node.get(segment))
            .cloned()
    }

    /// Returns a copy with every override applied.
    ///
    /// Each applied key is appended to `agent:config_keys`. A value for the
    /// accumulator itself replaces it without being recorded.
    pub fn merge(&self, overrides: &BTreeMap<String, Value>) -> Result<Self, ConfigError> {
        let mut tree = serde_json::to_value(self).map_err(|e| ConfigError::InvalidValue {
            key: String::new(),
            message: e.to_string(),
        })?;

        let mut applied = Vec::new();
        for (key, value) in overrides {
            set_path(&mut tree, key, value.clone())?;
            if key != CONFIG_KEYS_KEY {
                applied.push(key.clone());
            }
        }

        let mut merged: BerthConfig =
            serde_json::from_value(tree).map_err(|e| ConfigError::InvalidValue {
                key: overrides.keys().cloned().collect::<Vec<_>>().join(","),
                message: e.to_string(),
            })?;
        merged.agent.config_keys.extend(applied);
        Ok(merged)
    }

    /// Flatten every leaf into a colon-separated key map
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        if let Ok(tree) = serde_json::to_value(self) {
            flatten_into(&tree, String::new(), &mut out);
        }
        out
    }
}

fn set_path(tree: &mut Value, key: &str, value: Value) -> Result<(), ConfigError> {
    if key.is_empty() || key.split(':').any(str::is_empty) {
        return Err(ConfigError::InvalidKey(key.to_string()));
    }

    let segments: Vec<&str> = key.split(':').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;

    let mut node = tree;
    for segment in parents {
        let object = node
            .as_object_mut()
            .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;
        node = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    node.as_object_mut()
        .ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?
        .insert(last.to_string(), value);
    Ok(())
}

fn flatten_into(node: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match node {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}:{}", prefix, key)
                };
                flatten_into(child, path, out);
            }
        }
        leaf => {
            if !prefix.is_empty() {
                out.insert(prefix, leaf.clone());
            }
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "berth".to_string()
}

fn berth_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".berth")
}

fn default_api_socket() -> PathBuf {
    berth_home().join("run").join("api.sock")
}

fn default_agent_pid() -> PathBuf {
    berth_home().join("run").join("agent.pid")
}

fn default_ssh_key() -> PathBuf {
    berth_home().join("keys").join("id_rsa")
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_run_retry() -> u32 {
    10
}

fn default_run_timeout() -> u64 {
    2000
}

fn default_requires_vm() -> bool {
    cfg!(target_os = "macos")
}

fn default_vm_name() -> String {
    "berth-vm".to_string()
}

fn default_vm_ip() -> String {
    "192.168.51.4".to_string()
}

fn default_vm_user() -> String {
    "docker".to_string()
}

fn default_vm_start_timeout() -> u64 {
    180
}

fn default_mount_point() -> String {
    "/home/docker/share".to_string()
}

fn default_screenshot_dir() -> PathBuf {
    std::env::temp_dir()
}
