use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::StationError;

/// Exclusive claim on a station data directory, held for the life of the
/// process that drives it
pub struct StationLock {
    path: PathBuf,
    _guard: RwLockWriteGuard<'static, File>,
}

impl std::fmt::Debug for StationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationLock").field("path", &self.path).finish()
    }
}

impl StationLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, StationError> {
        let path = path.as_ref().to_path_buf();
        let io_error = |e: std::io::Error| StationError::Config {
            reason: format!("cannot open station lock {}: {e}", path.display()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = File::create(&path).map_err(io_error)?;

        // Leaked once per process; released when the process exits
        let lock = Box::leak(Box::new(RwLock::new(file)));
        let guard = lock.try_write().map_err(|_| StationError::Locked { path: path.clone() })?;

        debug!(path = %path.display(), "Station lock acquired");
        Ok(Self { path, _guard: guard })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
