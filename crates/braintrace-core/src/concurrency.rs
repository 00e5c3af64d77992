use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Exclusive lock on a data directory, held for the lifetime of a bootstrap.
pub struct StoreLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl StoreLock {
    /// Take the lock, or fail with [`CoreError::Lock`] if another instance
    /// holds it.
    pub fn try_acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { lock_file: file }),
            Err(_) => Err(CoreError::Lock(lock_path.to_path_buf())),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route SIGINT/SIGTERM to `on_shutdown`.
///
/// Only the first signal calls it. Later signals are logged and otherwise
/// ignored so the ordered dependency shutdown is never cut short.
pub fn install_signal_handler<F>(on_shutdown: F) -> Result<(), CoreError>
where
    F: Fn() + Send + 'static,
{
    ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress, waiting for dependencies to stop");
            return;
        }
        info!("shutdown requested");
        on_shutdown();
    })
    .map_err(|e| CoreError::Signal(e.to_string()))
}
