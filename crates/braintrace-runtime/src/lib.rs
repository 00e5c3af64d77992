//! Runtime collaborators of the BrainTrace dependency orchestrator.
//!
//! This crate implements everything that touches the host: classifying the
//! deployment environment (`EnvironmentDetector`), polling a dependency's
//! readiness endpoint under a hard deadline (`NetworkProber`), and spawning and
//! terminating dependency processes with a platform-appropriate graceful stop
//! (`ProcessSupervisor`, `GracefulStop`). Each concern sits behind a trait so the
//! orchestrator can be driven by the in-crate `mock` implementations in tests.

pub mod detect;
pub mod locate;
pub mod mock;
pub mod probe;
pub mod process;
pub mod signal;

pub use detect::{is_truthy, Detect, DeploymentMode, DetectionSignals, EnvironmentDetector};
pub use locate::locate_program;
pub use probe::{AttemptError, NetworkProber, Prober, Readiness, ReadinessTimeout};
pub use process::{ManagedProcess, ProcessSupervisor, Supervisor, TerminationOutcome};
pub use signal::{platform_graceful_stop, GracefulStop};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("program '{program}' not found ({} locations searched)", .searched.len())]
    ProgramNotFound {
        program: String,
        searched: Vec<PathBuf>,
    },
    #[error("failed to spawn '{name}' ({program}): {source}")]
    SpawnFailed {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal '{name}': {source}")]
    SignalFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
