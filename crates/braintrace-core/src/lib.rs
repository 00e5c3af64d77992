//! Lifecycle orchestration for the BrainTrace backend bootstrap.
//!
//! This crate ties together the bootstrap config, the metadata store, and the
//! runtime collaborators into the `Orchestrator`: the scoped resource that
//! brings dependencies up before the serving window opens and tears them down
//! after it closes. It also provides state-machine transition validation, the
//! data-directory instance lock, and signal handling.

pub mod concurrency;
pub mod lifecycle;
pub mod orchestrator;
pub mod report;

pub use concurrency::{install_signal_handler, StoreLock};
pub use lifecycle::{validate_transition, OrchestratorState};
pub use orchestrator::{Orchestrator, RunOutcome, REUSE_PROBE_TIMEOUT};
pub use report::{
    AnomalyKind, DependencyReport, DependencyStatus, ShutdownAnomaly, ShutdownReport,
    StartupReport,
};

use braintrace_schema::{Criticality, Severity};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] braintrace_schema::ConfigError),
    #[error("metadata store initialization failed: {0}")]
    MetadataInit(#[source] braintrace_store::StoreError),
    #[error("failed to start dependency '{name}': {source}")]
    Spawn {
        name: String,
        criticality: Criticality,
        #[source]
        source: braintrace_runtime::RuntimeError,
    },
    #[error("dependency '{name}' did not become ready: {source}")]
    ReadinessTimeout {
        name: String,
        criticality: Criticality,
        #[source]
        source: braintrace_runtime::ReadinessTimeout,
    },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("serving failed: {0}")]
    Serving(String),
    #[error("data directory lock {0} is held by another instance")]
    Lock(std::path::PathBuf),
    #[error("failed to install signal handler: {0}")]
    Signal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Dependency failures take the dependency's criticality; everything else
    /// ends startup.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Spawn { criticality, .. } | Self::ReadinessTimeout { criticality, .. } => {
                criticality.severity()
            }
            _ => Severity::Fatal,
        }
    }

    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Spawn { name, .. } | Self::ReadinessTimeout { name, .. } => Some(name),
            _ => None,
        }
    }
}
