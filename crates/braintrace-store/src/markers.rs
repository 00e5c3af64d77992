use crate::layout::StoreLayout;
use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MARKER_EXT: &str = "pid";

/// Pid markers for dependencies spawned by the current run.
///
/// A marker is written right after a successful spawn and removed after the
/// termination attempt. Markers found at startup belong to a run that never
/// reached its shutdown sequence.
#[derive(Debug, Clone)]
pub struct RunMarkers {
    dir: PathBuf,
}

/// A marker left behind by an earlier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleMarker {
    pub name: String,
    pub pid: Option<u32>,
    /// Whether a process with that pid still exists. The pid may have been
    /// reused, so this is only a hint for the operator.
    pub alive: bool,
}

impl RunMarkers {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            dir: layout.run_dir(),
        }
    }

    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{MARKER_EXT}"))
    }

    pub fn record(&self, name: &str, pid: u32) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.marker_path(name), pid.to_string())?;
        Ok(())
    }

    pub fn clear(&self, name: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.marker_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Collect and remove every marker in the run directory.
    pub fn sweep(&self) -> Result<Vec<StaleMarker>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut stale = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                continue;
            };

            let content = fs::read_to_string(&path).unwrap_or_default();
            let pid = content.trim().parse::<u32>().ok();
            if pid.is_none() {
                warn!(
                    "corrupt pid marker for {name}: could not parse pid from '{}'",
                    content.trim()
                );
            }
            let alive = pid.is_some_and(process_exists);
            debug!("removing stale pid marker {}", path.display());
            let _ = fs::remove_file(&path);
            stale.push(StaleMarker { name, pid, alive });
        }
        stale.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stale)
    }
}

fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
