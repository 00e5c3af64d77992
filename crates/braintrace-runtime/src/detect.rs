use braintrace_schema::DetectionSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Whether backing services are managed by the surrounding container
/// platform or by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Containerized,
    Standalone,
}

impl DeploymentMode {
    pub fn is_containerized(self) -> bool {
        self == Self::Containerized
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Containerized => write!(f, "containerized"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

/// Individual values of the three container signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionSignals {
    pub override_set: bool,
    pub marker_present: bool,
    pub cgroup_match: bool,
}

impl DetectionSignals {
    pub fn mode(self) -> DeploymentMode {
        if self.override_set || self.marker_present || self.cgroup_match {
            DeploymentMode::Containerized
        } else {
            DeploymentMode::Standalone
        }
    }

    /// The first signal that fired, in evaluation order.
    pub fn first_match(self) -> Option<&'static str> {
        if self.override_set {
            Some("override")
        } else if self.marker_present {
            Some("marker-file")
        } else if self.cgroup_match {
            Some("cgroup")
        } else {
            None
        }
    }
}

pub trait Detect: Send + Sync {
    /// Classify the host. Never fails: ambiguous hosts are `Standalone`.
    fn detect(&self) -> DeploymentMode;
}

/// Layered container detection: override variable, marker file, then the
/// init process's cgroup record.
#[derive(Debug, Clone)]
pub struct EnvironmentDetector {
    override_var: String,
    marker_file: PathBuf,
    cgroup_file: PathBuf,
    cgroup_markers: Vec<String>,
}

impl EnvironmentDetector {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            override_var: settings.override_var.clone(),
            marker_file: settings.marker_file.clone(),
            cgroup_file: settings.cgroup_file.clone(),
            cgroup_markers: settings.cgroup_markers.clone(),
        }
    }

    /// Evaluate all three signals, reading the override from the process
    /// environment.
    pub fn signals(&self) -> DetectionSignals {
        let value = if self.override_var.is_empty() {
            None
        } else {
            std::env::var(&self.override_var).ok()
        };
        self.signals_with(value.as_deref())
    }

    pub fn signals_with(&self, override_value: Option<&str>) -> DetectionSignals {
        DetectionSignals {
            override_set: override_value.is_some_and(is_truthy),
            marker_present: self.marker_file.exists(),
            cgroup_match: cgroup_matches(&self.cgroup_file, &self.cgroup_markers),
        }
    }
}

impl Detect for EnvironmentDetector {
    fn detect(&self) -> DeploymentMode {
        let signals = self.signals();
        let mode = signals.mode();
        info!(
            "deployment mode: {mode} (env {}={}, {}={}, cgroup={}, first match: {})",
            self.override_var,
            signals.override_set,
            self.marker_file.display(),
            signals.marker_present,
            signals.cgroup_match,
            signals.first_match().unwrap_or("none"),
        );
        mode
    }
}

/// `1`, `true`, and `yes` in any case, surrounding whitespace ignored.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn cgroup_matches(path: &Path, markers: &[String]) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => markers.iter().any(|m| content.contains(m.as_str())),
        Err(e) => {
            debug!("cgroup record {} unreadable: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        marker: PathBuf,
        cgroup: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join(".dockerenv");
            let cgroup = dir.path().join("cgroup");
            Self {
                _dir: dir,
                marker,
                cgroup,
            }
        }

        fn detector(&self) -> EnvironmentDetector {
            EnvironmentDetector::new(&DetectionSettings {
                override_var: "BRAINTRACE_TEST_NEVER_SET".to_owned(),
                marker_file: self.marker.clone(),
                cgroup_file: self.cgroup.clone(),
                cgroup_markers: vec!["docker".to_owned(), "kubepods".to_owned()],
            })
        }
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", "Yes", " yes "] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["", "0", "false", "no", "on", "y", "truthy"] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }

    #[test]
    fn every_signal_combination() {
        for bits in 0u8..8 {
            let fx = Fixture::new();
            let override_set = bits & 1 != 0;
            let marker_present = bits & 2 != 0;
            let cgroup_match = bits & 4 != 0;

            if marker_present {
                fs::write(&fx.marker, "").unwrap();
            }
            let cgroup = if cgroup_match {
                "0::/kubepods/besteffort/pod1234\n"
            } else {
                "0::/init.scope\n"
            };
            fs::write(&fx.cgroup, cgroup).unwrap();

            let value = override_set.then_some("true");
            let signals = fx.detector().signals_with(value);
            assert_eq!(
                signals,
                DetectionSignals {
                    override_set,
                    marker_present,
                    cgroup_match
                }
            );
            let expected = if bits == 0 {
                DeploymentMode::Standalone
            } else {
                DeploymentMode::Containerized
            };
            assert_eq!(signals.mode(), expected, "combination {bits:03b}");
        }
    }

    #[test]
    fn override_without_marker_and_unreadable_cgroup() {
        let fx = Fixture::new();
        // a directory cannot be read as a file
        fs::create_dir(&fx.cgroup).unwrap();
        let signals = fx.detector().signals_with(Some("true"));
        assert!(!signals.marker_present);
        assert!(!signals.cgroup_match);
        assert_eq!(signals.mode(), DeploymentMode::Containerized);
    }

    #[test]
    fn plain_host_is_standalone() {
        let fx = Fixture::new();
        fs::write(&fx.cgroup, "12:pids:/user.slice/user-1000.slice\n").unwrap();
        let detector = fx.detector();
        assert_eq!(detector.signals_with(None).mode(), DeploymentMode::Standalone);
        assert_eq!(detector.detect(), DeploymentMode::Standalone);
    }

    #[test]
    fn non_truthy_override_defers_to_other_signals() {
        let fx = Fixture::new();
        let signals = fx.detector().signals_with(Some("false"));
        assert!(!signals.override_set);
        assert_eq!(signals.mode(), DeploymentMode::Standalone);

        fs::write(&fx.marker, "").unwrap();
        let signals = fx.detector().signals_with(Some("false"));
        assert_eq!(signals.first_match(), Some("marker-file"));
        assert_eq!(signals.mode(), DeploymentMode::Containerized);
    }

    #[test]
    fn first_match_follows_evaluation_order() {
        let all = DetectionSignals {
            override_set: true,
            marker_present: true,
            cgroup_match: true,
        };
        assert_eq!(all.first_match(), Some("override"));
        let cgroup_only = DetectionSignals {
            cgroup_match: true,
            ..DetectionSignals::default()
        };
        assert_eq!(cgroup_only.first_match(), Some("cgroup"));
        assert_eq!(DetectionSignals::default().first_match(), None);
    }

    #[test]
    fn docker_cgroup_v1_record_matches() {
        let fx = Fixture::new();
        fs::write(
            &fx.cgroup,
            "12:memory:/docker/3f1c9a2b\n11:cpu:/docker/3f1c9a2b\n",
        )
        .unwrap();
        assert!(fx.detector().signals_with(None).cgroup_match);
    }
}
