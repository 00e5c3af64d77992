use crate::CoreError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Uninitialized,
    Detecting,
    StartingDependencies,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Detecting => "detecting",
            Self::StartingDependencies => "starting_dependencies",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(
    from: OrchestratorState,
    to: OrchestratorState,
) -> Result<(), CoreError> {
    use OrchestratorState::{
        Detecting, Ready, ShuttingDown, StartingDependencies, Stopped, Uninitialized,
    };

    let valid = matches!(
        (from, to),
        (Uninitialized, Detecting)
            | (Detecting, StartingDependencies)
            | (StartingDependencies, Ready)
            | (
                Uninitialized | Detecting | StartingDependencies | Ready,
                ShuttingDown
            )
            | (ShuttingDown, Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
