//! # File Model Lock
//!
//! Cross-process [`ModelLock`] backed by advisory `flock(2)` locks on
//! `<model>.lock` files in the run directory.
//!
//! The monitor daemon and every CLI verb open their own controller, often in
//! different processes. All of them point at the same run directory, so
//! taking the lock file serializes their lifecycle operations per model.
//! Each acquire opens the file anew, which makes the lock exclusive between
//! threads of one process too. The kernel drops the lock when the holder
//! exits, so a crashed command never leaves the model locked.

use modelops_core::{ModelLock, ModelLockGuard, ModelName, OpsError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Per-model advisory file lock.
#[derive(Debug, Clone)]
pub struct FileModelLock {
    dir: PathBuf,
}

impl FileModelLock {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, OpsError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| OpsError::IoError(format!("create lock directory: {}", e)))?;
        Ok(Self { dir })
    }

    /// Lock file guarding `model`.
    #[must_use]
    pub fn lock_path(&self, model: &ModelName) -> PathBuf {
        self.dir.join(format!("{}.lock", model.as_str()))
    }
}

/// Open lock file; the lock is released when it is dropped.
struct HeldFile {
    file: File,
    path: PathBuf,
}

impl Drop for HeldFile {
    fn drop(&mut self) {
        flock::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "model lock released");
    }
}

impl ModelLock for FileModelLock {
    fn acquire(&self, model: &ModelName) -> Result<ModelLockGuard, OpsError> {
        let path = self.lock_path(model);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| OpsError::IoError(format!("open {}: {}", path.display(), e)))?;

        if !flock::try_lock(&file)? {
            tracing::info!(
                model = %model,
                path = %path.display(),
                "model is locked by another operation, waiting"
            );
            flock::lock(&file)?;
        }
        Ok(ModelLockGuard::new(HeldFile { file, path }))
    }
}

#[cfg(unix)]
mod flock {
    use modelops_core::OpsError;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    fn lock_err(e: std::io::Error) -> OpsError {
        OpsError::IoError(format!("flock failed: {}", e))
    }

    /// Take the lock without blocking; `false` if another holder has it.
    pub fn try_lock(file: &File) -> Result<bool, OpsError> {
        // SAFETY: the descriptor stays open for the duration of the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(lock_err(errno))
        }
    }

    /// Block until the lock is held.
    pub fn lock(file: &File) -> Result<(), OpsError> {
        loop {
            // SAFETY: as above.
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(());
            }
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EINTR) {
                return Err(lock_err(errno));
            }
        }
    }

    pub fn unlock(file: &File) {
        // SAFETY: as above.
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(not(unix))]
mod flock {
    use modelops_core::OpsError;
    use std::fs::File;

    // Without flock the lock only marks the file; callers in other processes
    // are not excluded.
    pub fn try_lock(_file: &File) -> Result<bool, OpsError> {
        Ok(true)
    }

    pub fn lock(_file: &File) -> Result<(), OpsError> {
        Ok(())
    }

    pub fn unlock(_file: &File) {}
}

// =============================================================================
// TESTS
// =============================================================================
