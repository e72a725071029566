//! On-disk status store.
//!
//! Layout under the metadata directory:
//! ```text
//! <meta>/state            single update-state token
//! <meta>/snapshot-boot    slot suffix recorded when writes finished
//! <meta>/snapshots/<name> 7-token per-snapshot status line
//! ```
//! Writes truncate, seek to zero, write, then fsync, so whoever takes the
//! lock next observes the committed value. Reads that hit an unrecognized
//! token or a wrong field count fail with `CorruptState` and leave the file
//! untouched.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotError};
use crate::lock::LockedFile;
use crate::state::{SnapshotStatus, UpdateState};

const STATE_FILE: &str = "state";
const BOOT_INDICATOR_FILE: &str = "snapshot-boot";
const SNAPSHOT_DIR: &str = "snapshots";

/// Reads and writes the state file, boot indicator, and per-snapshot
/// status records under one metadata directory.
#[derive(Debug, Clone)]
pub struct StatusStore {
    metadata_dir: PathBuf,
}

impl StatusStore {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        StatusStore {
            metadata_dir: metadata_dir.into(),
        }
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.metadata_dir.join(STATE_FILE)
    }

    pub fn boot_indicator_path(&self) -> PathBuf {
        self.metadata_dir.join(BOOT_INDICATOR_FILE)
    }

    fn snapshot_file_path(&self, name: &str) -> PathBuf {
        self.metadata_dir.join(SNAPSHOT_DIR).join(name)
    }

    /// Read the update state through a held lock. The lock's own handle is
    /// reused so read-modify-write sequences see their previous write.
    pub fn read_update_state(&self, lock: &LockedFile) -> Result<UpdateState> {
        let mut file = lock.file();
        file.seek(SeekFrom::Start(0))
            .map_err(|e| SnapshotError::corrupt(format!("seek state file: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| SnapshotError::corrupt(format!("read state file: {e}")))?;
        contents.parse()
    }

    /// Persist the update state. `Cancelled` is transient and must never
    /// reach the disk.
    pub fn write_update_state(&self, lock: &LockedFile, state: UpdateState) -> Result<()> {
        lock.ensure_exclusive("write_update_state")?;
        debug_assert!(state != UpdateState::Cancelled, "Cancelled is never persisted");
        if state == UpdateState::Cancelled {
            return Err(SnapshotError::InvalidTransition {
                op: "write_update_state",
                state: state.to_string(),
            });
        }
        let mut file = lock.file();
        file.set_len(0)
            .map_err(|e| SnapshotError::corrupt(format!("truncate state file: {e}")))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| SnapshotError::corrupt(format!("seek state file: {e}")))?;
        file.write_all(state.to_string().as_bytes())
            .map_err(|e| SnapshotError::corrupt(format!("write state file: {e}")))?;
        file.sync_all()
            .map_err(|e| SnapshotError::corrupt(format!("sync state file: {e}")))?;
        tracing::info!(state = %state, "Update state written");
        Ok(())
    }

    /// Read one snapshot's status record.
    pub fn read_snapshot_status(&self, _lock: &LockedFile, name: &str) -> Result<SnapshotStatus> {
        let path = self.snapshot_file_path(name);
        let contents = fs::read_to_string(&path).map_err(|e| {
            SnapshotError::corrupt(format!("read snapshot status {}: {e}", path.display()))
        })?;
        SnapshotStatus::decode(&contents)
    }

    /// Whether a status record exists for the named snapshot.
    pub fn snapshot_status_exists(&self, name: &str) -> bool {
        self.snapshot_file_path(name).exists()
    }

    /// Write one snapshot's status record atomically (truncate + write +
    /// sync of one small file).
    pub fn write_snapshot_status(
        &self,
        lock: &LockedFile,
        name: &str,
        status: &SnapshotStatus,
    ) -> Result<()> {
        lock.ensure_exclusive("write_snapshot_status")?;
        status.check_aligned()?;
        let path = self.snapshot_file_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SnapshotError::corrupt(format!("create {}: {e}", parent.display()))
            })?;
        }
        let mut file = fs::File::create(&path)
            .map_err(|e| SnapshotError::corrupt(format!("open {}: {e}", path.display())))?;
        file.write_all(status.encode().as_bytes())
            .map_err(|e| SnapshotError::corrupt(format!("write {}: {e}", path.display())))?;
        file.sync_all()
            .map_err(|e| SnapshotError::corrupt(format!("sync {}: {e}", path.display())))?;
        Ok(())
    }

    /// Remove a snapshot's status record. Missing files are fine.
    pub fn remove_snapshot_status(&self, lock: &LockedFile, name: &str) -> Result<()> {
        lock.ensure_exclusive("remove_snapshot_status")?;
        let path = self.snapshot_file_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnapshotError::corrupt(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }

    /// List the names of all snapshots with a status record.
    pub fn list_snapshots(&self, _lock: &LockedFile) -> Result<Vec<String>> {
        let dir = self.metadata_dir.join(SNAPSHOT_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(&dir)
            .map_err(|e| SnapshotError::corrupt(format!("read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| SnapshotError::corrupt(format!("read {}: {e}", dir.display())))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Record the slot suffix we are updating away from. Presence of this
    /// file means an update is awaiting first boot or is mid-lifecycle.
    pub fn write_boot_indicator(&self, lock: &LockedFile, slot_suffix: &str) -> Result<()> {
        lock.ensure_exclusive("write_boot_indicator")?;
        let path = self.boot_indicator_path();
        let mut file = fs::File::create(&path)
            .map_err(|e| SnapshotError::corrupt(format!("open {}: {e}", path.display())))?;
        file.write_all(slot_suffix.as_bytes())
            .map_err(|e| SnapshotError::corrupt(format!("write {}: {e}", path.display())))?;
        file.sync_all()
            .map_err(|e| SnapshotError::corrupt(format!("sync {}: {e}", path.display())))?;
        Ok(())
    }

    /// Read the boot indicator; `None` if no update is pending.
    pub fn read_boot_indicator(&self) -> Option<String> {
        fs::read_to_string(self.boot_indicator_path())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Remove the boot indicator. Best-effort: callers perform a deeper
    /// state check after reading it, so a leftover file is harmless.
    pub fn remove_boot_indicator(&self) {
        let path = self.boot_indicator_path();
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(path = %path.display(), error = %e, "Failed to remove boot indicator");
            }
        }
    }
}

/// Single-file existence probe for first-stage boot. Deliberately free of
/// any engine state so it can run before collaborators are constructed.
pub fn boot_indicator_exists(metadata_dir: &Path) -> bool {
    metadata_dir.join(BOOT_INDICATOR_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{lock_exclusive, lock_shared};
    use crate::state::SnapshotState;

    fn store() -> (tempfile::TempDir, StatusStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn update_state_round_trip() {
        let (_dir, store) = store();
        let lock = lock_exclusive(&store.state_file_path()).unwrap();
        assert_eq!(store.read_update_state(&lock).unwrap(), UpdateState::None);
        for state in [
            UpdateState::Initiated,
            UpdateState::Unverified,
            UpdateState::Merging,
            UpdateState::MergeNeedsReboot,
            UpdateState::MergeFailed,
            UpdateState::MergeCompleted,
            UpdateState::None,
        ] {
            store.write_update_state(&lock, state).unwrap();
            assert_eq!(store.read_update_state(&lock).unwrap(), state);
        }
    }

    #[test]
    fn update_state_write_truncates_previous() {
        let (_dir, store) = store();
        let lock = lock_exclusive(&store.state_file_path()).unwrap();
        store
            .write_update_state(&lock, UpdateState::MergeNeedsReboot)
            .unwrap();
        store.write_update_state(&lock, UpdateState::None).unwrap();
        let contents = fs::read_to_string(store.state_file_path()).unwrap();
        assert_eq!(contents, "none");
    }

    #[test]
    fn corrupt_state_file_is_surfaced() {
        let (_dir, store) = store();
        drop(lock_exclusive(&store.state_file_path()).unwrap());
        fs::write(store.state_file_path(), "garbage").unwrap();
        let lock = lock_shared(&store.state_file_path()).unwrap();
        assert!(matches!(
            store.read_update_state(&lock).unwrap_err(),
            SnapshotError::CorruptState { .. }
        ));
    }

    #[test]
    fn snapshot_status_round_trip_and_list() {
        let (_dir, store) = store();
        let lock = lock_exclusive(&store.state_file_path()).unwrap();
        let status = SnapshotStatus {
            state: SnapshotState::Created,
            device_size: 8192,
            snapshot_size: 4096,
            cow_file_size: 4096,
            ..Default::default()
        };
        store
            .write_snapshot_status(&lock, "system_b", &status)
            .unwrap();
        assert_eq!(
            store.read_snapshot_status(&lock, "system_b").unwrap(),
            status
        );
        assert_eq!(store.list_snapshots(&lock).unwrap(), vec!["system_b"]);

        store.remove_snapshot_status(&lock, "system_b").unwrap();
        assert!(store.list_snapshots(&lock).unwrap().is_empty());
        // Removing twice is fine.
        store.remove_snapshot_status(&lock, "system_b").unwrap();
    }

    #[test]
    fn unaligned_status_never_reaches_disk() {
        let (_dir, store) = store();
        let lock = lock_exclusive(&store.state_file_path()).unwrap();
        let status = SnapshotStatus {
            state: SnapshotState::Created,
            device_size: 8193,
            ..Default::default()
        };
        assert!(store
            .write_snapshot_status(&lock, "system_b", &status)
            .is_err());
        assert!(!store.snapshot_status_exists("system_b"));
    }

    #[test]
    fn boot_indicator_lifecycle() {
        let (dir, store) = store();
        assert!(!boot_indicator_exists(dir.path()));
        assert_eq!(store.read_boot_indicator(), None);

        let lock = lock_exclusive(&store.state_file_path()).unwrap();
        store.write_boot_indicator(&lock, "_a").unwrap();
        assert!(boot_indicator_exists(dir.path()));
        assert_eq!(store.read_boot_indicator().as_deref(), Some("_a"));

        store.remove_boot_indicator();
        assert_eq!(store.read_boot_indicator(), None);
        // Removing twice logs nothing and does not panic.
        store.remove_boot_indicator();
    }
}
