use crate::config::{BootstrapConfig, ConfigError, DependencySection, ReadinessSection};
use crate::types::Criticality;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Validated bootstrap configuration with every default resolved and every
/// relative path anchored at the config's base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedConfig {
    pub shutdown_grace: Duration,
    pub probe_interval: Duration,
    pub force_kill_after_grace: bool,
    pub detection: DetectionSettings,
    /// In declaration order; startup walks them front to back.
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionSettings {
    pub override_var: String,
    pub marker_file: PathBuf,
    pub cgroup_file: PathBuf,
    pub cgroup_markers: Vec<String>,
}

/// One backing service that must be usable before serving begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    /// In containerized mode: never spawn, only probe.
    pub attach_only: bool,
    pub criticality: Criticality,
    pub readiness: ReadinessTarget,
    pub readiness_timeout: Duration,
    /// In spawn mode: probe once first and attach if already answering.
    pub reuse_running: bool,
    pub spawn: SpawnCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReadinessTarget {
    /// Ready once a TCP connection completes.
    Tcp { host: String, port: u16 },
    /// Ready once a GET on the liveness URL returns a success status.
    Http { url: String },
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Http { url } => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    /// Tried in order when `program` cannot be located.
    pub fallbacks: Vec<String>,
    pub args: Vec<String>,
    pub search_paths: Vec<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub base_dir: PathBuf,
}

impl SpawnCommand {
    /// Program candidates in resolution order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }

    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl BootstrapConfig {
    /// Validate the config and resolve defaults, reading endpoint overrides
    /// from the process environment.
    pub fn normalize(&self, base_dir: &Path) -> Result<NormalizedConfig, ConfigError> {
        self.normalize_with_env(base_dir, |key| std::env::var(key).ok())
    }

    pub fn normalize_with_env(
        &self,
        base_dir: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<NormalizedConfig, ConfigError> {
        if self.config_version != 1 {
            return Err(ConfigError::UnsupportedVersion(self.config_version));
        }
        if self.probe_interval_ms == 0 || self.probe_interval_ms >= 1000 {
            return Err(ConfigError::InvalidProbeInterval(self.probe_interval_ms));
        }

        let mut seen = HashSet::new();
        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for section in &self.dependencies {
            let name = section.name.trim().to_owned();
            validate_dependency_name(&name)?;
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateDependency(name));
            }
            dependencies.push(normalize_dependency(name, section, base_dir, &lookup)?);
        }

        Ok(NormalizedConfig {
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            force_kill_after_grace: self.force_kill_after_grace,
            detection: DetectionSettings {
                override_var: self.detection.override_var.trim().to_owned(),
                marker_file: PathBuf::from(&self.detection.marker_file),
                cgroup_file: PathBuf::from(&self.detection.cgroup_file),
                cgroup_markers: self
                    .detection
                    .cgroup_markers
                    .iter()
                    .map(|m| m.trim().to_owned())
                    .filter(|m| !m.is_empty())
                    .collect(),
            },
            dependencies,
        })
    }
}

/// Dependency names end up in pid marker file names, so they are restricted
/// to `[a-zA-Z0-9_-]`.
pub fn validate_dependency_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };
    if name.is_empty() || name.len() > 64 {
        return Err(invalid("must be 1-64 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(invalid("must match [a-zA-Z0-9_-]"));
    }
    Ok(())
}

fn normalize_dependency(
    name: String,
    section: &DependencySection,
    base_dir: &Path,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Dependency, ConfigError> {
    if section.readiness_timeout_secs == 0 {
        return Err(ConfigError::ZeroTimeout(name));
    }

    let program = section.spawn.program.trim().to_owned();
    if program.is_empty() {
        return Err(ConfigError::EmptySpawnProgram(name));
    }

    let endpoint_override = section
        .endpoint_env
        .as_deref()
        .and_then(|key| lookup(key))
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty());
    let readiness = parse_readiness(&name, &section.readiness, endpoint_override)?;

    let spawn = SpawnCommand {
        program,
        fallbacks: normalize_string_list(&section.spawn.fallbacks),
        args: section.spawn.args.clone(),
        search_paths: section
            .spawn
            .search_paths
            .iter()
            .map(|p| base_dir.join(p))
            .collect(),
        working_dir: section.spawn.working_dir.as_ref().map(|d| base_dir.join(d)),
        env: section.spawn.env.clone(),
        base_dir: base_dir.to_path_buf(),
    };

    Ok(Dependency {
        name,
        attach_only: section.attach_only,
        criticality: section.criticality,
        readiness,
        readiness_timeout: Duration::from_secs(section.readiness_timeout_secs),
        reuse_running: section.reuse_running,
        spawn,
    })
}

fn parse_readiness(
    name: &str,
    section: &ReadinessSection,
    endpoint_override: Option<String>,
) -> Result<ReadinessTarget, ConfigError> {
    match (&section.tcp, &section.http) {
        (Some(tcp), None) => {
            let address = endpoint_override.unwrap_or_else(|| tcp.trim().to_owned());
            parse_tcp_target(&address).ok_or_else(|| ConfigError::InvalidTcpTarget {
                name: name.to_owned(),
                target: address,
            })
        }
        (None, Some(http)) => {
            let base = endpoint_override.unwrap_or_else(|| http.trim().to_owned());
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return Err(ConfigError::InvalidHttpTarget {
                    name: name.to_owned(),
                    target: base,
                });
            }
            let path = section.path.as_deref().map(str::trim).unwrap_or_default();
            let url = if path.is_empty() {
                base
            } else {
                format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    path.trim_start_matches('/')
                )
            };
            Ok(ReadinessTarget::Http { url })
        }
        _ => Err(ConfigError::AmbiguousReadiness {
            name: name.to_owned(),
        }),
    }
}

/// Parse `host:port` or `[v6]:port`.
fn parse_tcp_target(address: &str) -> Option<ReadinessTarget> {
    let (host, port) = address.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .trim();
    let port: u16 = port.trim().parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(ReadinessTarget::Tcp {
        host: host.to_owned(),
        port,
    })
}

fn normalize_string_list(input: &[String]) -> Vec<String> {
    input
        .iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}
