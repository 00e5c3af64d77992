use braintrace_runtime::DeploymentMode;
use braintrace_schema::Severity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// How a dependency came up, or why it did not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DependencyStatus {
    /// Managed by the container platform; only probed.
    Attached { ready_after_ms: u64 },
    /// Already running on the host; adopted without spawning.
    Reused { ready_after_ms: u64 },
    /// Spawned by this run and ready.
    Spawned {
        pid: Option<u32>,
        started_at: DateTime<Utc>,
        ready_after_ms: u64,
    },
    /// Failed with Degraded criticality; startup went on without it.
    Degraded { error: String },
}

impl DependencyStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub name: String,
    #[serde(flatten)]
    pub status: DependencyStatus,
}

/// Outcome of a completed startup sequence, handed to the serving window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub mode: DeploymentMode,
    pub started_at: DateTime<Utc>,
    pub dependencies: Vec<DependencyReport>,
}

impl StartupReport {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            started_at: Utc::now(),
            dependencies: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &str, status: DependencyStatus) {
        self.dependencies.push(DependencyReport {
            name: name.to_owned(),
            status,
        });
    }

    pub fn status(&self, name: &str) -> Option<&DependencyStatus> {
        self.dependencies
            .iter()
            .find(|d| d.name == name)
            .map(|d| &d.status)
    }

    pub fn degraded(&self) -> impl Iterator<Item = &DependencyReport> {
        self.dependencies.iter().filter(|d| d.status.is_degraded())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded().next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyKind {
    /// Still running when the grace period ended.
    TimedOut { grace: Duration, killed: bool },
    /// The stop request itself failed.
    Failed(String),
}

/// A managed process that did not stop cleanly. Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownAnomaly {
    pub name: String,
    pub pid: Option<u32>,
    pub kind: AnomalyKind,
}

impl ShutdownAnomaly {
    pub fn severity(&self) -> Severity {
        Severity::Anomaly
    }
}

impl fmt::Display for ShutdownAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(pid) = self.pid {
            write!(f, " (pid {pid})")?;
        }
        match &self.kind {
            AnomalyKind::TimedOut { grace, killed: true } => {
                write!(f, " did not exit within {grace:?}, killed")
            }
            AnomalyKind::TimedOut {
                grace,
                killed: false,
            } => write!(f, " did not exit within {grace:?}, left running"),
            AnomalyKind::Failed(e) => write!(f, " could not be stopped: {e}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Processes that exited cleanly, in termination order.
    pub stopped: Vec<String>,
    pub anomalies: Vec<ShutdownAnomaly>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    /// Every process a termination was attempted for, clean or not.
    pub fn attempted(&self) -> usize {
        self.stopped.len() + self.anomalies.len()
    }
}
