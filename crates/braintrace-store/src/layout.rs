use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Data directory format. Bumped when the layout changes incompatibly.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Per-format document upload directories, created for the application
/// that runs behind the bootstrap.
pub const UPLOAD_KINDS: &[&str] = &["pdfs", "txts", "mds", "docx"];

/// Paths inside a BrainTrace data directory.
///
/// ```text
/// <root>/metadata/               application metadata
/// <root>/metadata/format.json     format stamp
/// <root>/uploads/<kind>/          uploaded documents
/// <root>/run/                     pid markers, instance lock
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

/// Written once when a data directory is first initialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatStamp {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn upload_dir(&self, kind: &str) -> PathBuf {
        self.root.join("uploads").join(kind)
    }

    /// Pid markers of spawned dependencies and the instance lock.
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.run_dir().join(".lock")
    }

    fn stamp_file(&self) -> PathBuf {
        self.metadata_dir().join("format.json")
    }

    /// Create the directory tree and stamp it, or check the existing stamp.
    ///
    /// Safe to call on every start.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let dirs = [self.metadata_dir(), self.run_dir()]
            .into_iter()
            .chain(UPLOAD_KINDS.iter().map(|kind| self.upload_dir(kind)));
        for dir in dirs {
            fs::create_dir_all(&dir)?;
        }

        match self.read_stamp()? {
            Some(stamp) if stamp.format_version == STORE_FORMAT_VERSION => {
                debug!(
                    "data directory {} created {}",
                    self.root.display(),
                    stamp.created_at
                );
                Ok(())
            }
            Some(stamp) => Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: stamp.format_version,
            }),
            None => {
                let stamp = FormatStamp {
                    format_version: STORE_FORMAT_VERSION,
                    created_at: Utc::now(),
                };
                write_atomic(&self.stamp_file(), &serde_json::to_vec_pretty(&stamp)?)?;
                info!("initialized data directory {}", self.root.display());
                Ok(())
            }
        }
    }

    /// The format stamp, or `None` for a directory never initialized.
    pub fn read_stamp(&self) -> Result<Option<FormatStamp>, StoreError> {
        match fs::read(self.stamp_file()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Replace `path` with `content` through a synced temp file in the same directory.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}
