//! Per-asset advisory lock shared by every worker process using the same
//! cache directory.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};

/// Suffix of the lock file next to each cached asset
pub const LOCK_SUFFIX: &str = ".lck";

/// Exclusive OS-level lock on `<dir>/<name>.lck`, released on drop
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Path of the lock file guarding `name` inside `dir`
    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}{}", name, LOCK_SUFFIX))
    }

    /// Try to take the lock without blocking.
    /// Fails with `LockBusy` when another process (or open handle) holds it.
    pub fn try_acquire(dir: &Path, name: &str) -> WorkerResult<Self> {
        let path = Self::path_for(dir, name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("Acquired cache lock {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => Err(WorkerError::LockBusy {
                id: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `path` is a lock file currently held by someone else
    pub fn is_held(path: &Path) -> bool {
        let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
            return false;
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(e) => is_contended(&e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// ERROR_LOCK_VIOLATION
#[cfg(windows)]
const WINDOWS_LOCK_VIOLATION: i32 = 33;

fn is_contended(e: &std::io::Error) -> bool {
    #[cfg(windows)]
    if e.raw_os_error() == Some(WINDOWS_LOCK_VIOLATION) {
        return true;
    }
    e.kind() == ErrorKind::WouldBlock
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release cache lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let first = CacheLock::try_acquire(dir.path(), "abc").unwrap();
        assert!(first.path().ends_with("abc.lck"));

        let err = CacheLock::try_acquire(dir.path(), "abc").unwrap_err();
        assert!(matches!(err, WorkerError::LockBusy { ref id } if id == "abc"));
        assert!(CacheLock::is_held(first.path()));
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = CacheLock::try_acquire(dir.path(), "abc").unwrap();
        }
        let again = CacheLock::try_acquire(dir.path(), "abc");
        assert!(again.is_ok());
    }

    #[test]
    fn test_independent_names_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let _a = CacheLock::try_acquire(dir.path(), "aaa").unwrap();
        let b = CacheLock::try_acquire(dir.path(), "bbb");
        assert!(b.is_ok());
        assert!(!CacheLock::is_held(&CacheLock::path_for(dir.path(), "ccc")));
    }
}
