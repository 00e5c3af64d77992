//! Durable local state for the BrainTrace backend.
//!
//! This crate owns the data directory: `StoreLayout` creates the metadata
//! home, upload directories, and run directory and stamps a format version,
//! `RunMarkers` records the pids of spawned dependencies so a crashed run can
//! be detected on the next start, and the `MetadataStore` trait is the
//! initializer seam the lifecycle orchestrator calls before anything else.

pub mod layout;
pub mod markers;

pub use layout::{FormatStamp, StoreLayout, STORE_FORMAT_VERSION, UPLOAD_KINDS};
pub use markers::{RunMarkers, StaleMarker};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("metadata initialization failed: {0}")]
    Init(String),
}

/// The relational metadata store, seen only through its initializer.
///
/// `initialize` must be idempotent: calling it on an already-initialized
/// store is a no-op.
pub trait MetadataStore: Send + Sync {
    fn initialize(&self) -> Result<(), StoreError>;
}

impl MetadataStore for StoreLayout {
    fn initialize(&self) -> Result<(), StoreError> {
        StoreLayout::initialize(self)
    }
}
