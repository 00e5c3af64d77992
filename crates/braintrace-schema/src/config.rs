use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::types::Criticality;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported config_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("invalid dependency name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("dependency '{0}' is declared more than once")]
    DuplicateDependency(String),
    #[error("dependency '{0}': spawn.program must not be empty")]
    EmptySpawnProgram(String),
    #[error("dependency '{name}': readiness must set exactly one of 'tcp' or 'http'")]
    AmbiguousReadiness { name: String },
    #[error("dependency '{name}': invalid tcp target '{target}', expected '<host>:<port>'")]
    InvalidTcpTarget { name: String, target: String },
    #[error("dependency '{name}': invalid http target '{target}', expected http(s)://...")]
    InvalidHttpTarget { name: String, target: String },
    #[error("dependency '{0}': readiness_timeout_secs must be greater than zero")]
    ZeroTimeout(String),
    #[error("probe_interval_ms must be between 1 and 999, got {0}")]
    InvalidProbeInterval(u64),
}

/// Raw bootstrap configuration as written in `braintrace.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    pub config_version: u32,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_true")]
    pub force_kill_after_grace: bool,
    #[serde(default)]
    pub detection: DetectionSection,
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<DependencySection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DetectionSection {
    #[serde(default = "default_override_var")]
    pub override_var: String,
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    #[serde(default = "default_cgroup_file")]
    pub cgroup_file: String,
    #[serde(default = "default_cgroup_markers")]
    pub cgroup_markers: Vec<String>,
}

impl Default for DetectionSection {
    fn default() -> Self {
        Self {
            override_var: default_override_var(),
            marker_file: default_marker_file(),
            cgroup_file: default_cgroup_file(),
            cgroup_markers: default_cgroup_markers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DependencySection {
    pub name: String,
    #[serde(default = "default_true")]
    pub attach_only: bool,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default)]
    pub reuse_running: bool,
    #[serde(default)]
    pub endpoint_env: Option<String>,
    pub readiness: ReadinessSection,
    pub spawn: SpawnSection,
}

/// Exactly one of `tcp` or `http` must be set. `path` only applies to `http`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReadinessSection {
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SpawnSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub search_paths: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_readiness_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_override_var() -> String {
    "IN_DOCKER".to_owned()
}

fn default_marker_file() -> String {
    "/.dockerenv".to_owned()
}

fn default_cgroup_file() -> String {
    "/proc/1/cgroup".to_owned()
}

fn default_cgroup_markers() -> Vec<String> {
    vec!["docker".to_owned(), "kubepods".to_owned()]
}

pub fn parse_config_str(input: &str) -> Result<BootstrapConfig, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<BootstrapConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
