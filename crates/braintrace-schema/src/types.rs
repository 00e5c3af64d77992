use serde::{Deserialize, Serialize};
use std::fmt;

/// What a readiness failure of a dependency means for application startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    /// Abort startup and propagate the failure.
    #[default]
    Fatal,
    /// Log a warning and continue with the next dependency.
    Degraded,
}

/// Severity of a lifecycle condition, independent of its message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Degraded,
    Anomaly,
}

impl Criticality {
    pub fn severity(self) -> Severity {
        match self {
            Self::Fatal => Severity::Fatal,
            Self::Degraded => Severity::Degraded,
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Degraded => write!(f, "degraded"),
            Self::Anomaly => write!(f, "anomaly"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_maps_to_severity() {
        assert_eq!(Criticality::Fatal.severity(), Severity::Fatal);
        assert_eq!(Criticality::Degraded.severity(), Severity::Degraded);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(Criticality::Degraded.to_string(), "degraded");
        assert_eq!(Severity::Anomaly.to_string(), "anomaly");
    }
}
