//! Advisory file locks over the state file.
//!
//! The engine is linked into several processes (update client, first-stage
//! boot, post-boot daemon) which coordinate purely through flock(2) on the
//! state file. Locks are process-wide: they do not serialize threads within
//! one process. Every mutation of the store requires the exclusive lock;
//! read-only inspection may use the shared lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Proof of a held lock on the state file. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockedFile {
    path: PathBuf,
    file: File,
    mode: LockMode,
}

impl LockedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Mutating store operations take this as their proof-of-lock. A shared
    /// holder reaching a mutation is a caller bug; it is surfaced as an
    /// error rather than a panic so a misbehaving caller cannot take down
    /// first-stage boot.
    pub fn ensure_exclusive(&self, op: &'static str) -> Result<()> {
        debug_assert_eq!(self.mode, LockMode::Exclusive, "{op} requires the exclusive lock");
        if self.mode != LockMode::Exclusive {
            return Err(SnapshotError::InvalidTransition {
                op,
                state: "shared lock held".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to unlock state file");
        }
    }
}

/// Take the shared lock. The state file must already exist.
pub fn lock_shared(state_path: &Path) -> Result<LockedFile> {
    let file = OpenOptions::new()
        .read(true)
        .open(state_path)
        .map_err(|source| SnapshotError::LockFailed { source })?;
    file.lock_shared()
        .map_err(|source| SnapshotError::LockFailed { source })?;
    Ok(LockedFile {
        path: state_path.to_path_buf(),
        file,
        mode: LockMode::Shared,
    })
}

/// Take the exclusive lock, creating the state file if needed.
pub fn lock_exclusive(state_path: &Path) -> Result<LockedFile> {
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SnapshotError::LockFailed { source })?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(state_path)
        .map_err(|source| SnapshotError::LockFailed { source })?;
    file.lock_exclusive()
        .map_err(|source| SnapshotError::LockFailed { source })?;
    Ok(LockedFile {
        path: state_path.to_path_buf(),
        file,
        mode: LockMode::Exclusive,
    })
}

/// Open the state file without any lock. Used only by `dump`, which is
/// allowed to be racy.
pub fn open_unlocked(state_path: &Path) -> Result<LockedFile> {
    let file = OpenOptions::new()
        .read(true)
        .open(state_path)
        .map_err(|source| SnapshotError::LockFailed { source })?;
    Ok(LockedFile {
        path: state_path.to_path_buf(),
        file,
        mode: LockMode::Shared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_creates_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        assert!(!path.exists());
        let lock = lock_exclusive(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.mode(), LockMode::Exclusive);
        assert!(lock.ensure_exclusive("test").is_ok());
    }

    #[test]
    fn shared_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        assert!(matches!(
            lock_shared(&path).unwrap_err(),
            SnapshotError::LockFailed { .. }
        ));
        drop(lock_exclusive(&path).unwrap());
        let lock = lock_shared(&path).unwrap();
        assert_eq!(lock.mode(), LockMode::Shared);
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        drop(lock_exclusive(&path).unwrap());
        // A second exclusive acquisition would block forever if the first
        // were still held (same process re-locking is a no-op for flock, so
        // exercise via a fresh handle after drop).
        drop(lock_exclusive(&path).unwrap());
    }
}
