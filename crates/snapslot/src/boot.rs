//! First-stage boot helpers.
//!
//! First-stage init runs before any userspace service: it cannot reach a
//! device daemon and has no udev. These helpers give it a zero-dependency
//! probe and a manager wired to the local image backend.

use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::SnapshotManager;
use crate::error::Result;
use crate::hooks::DeviceHooks;
use crate::images::LocalImageManager;
use crate::mapper::BlockMapper;
use crate::metadata::MetadataStore;
use crate::store::boot_indicator_exists;

/// Cheap probe for whether first-stage mount may need the snapshot
/// manager at all: a single stat of the boot indicator. Usable before any
/// collaborator can be constructed.
pub fn is_snapshot_manager_needed(metadata_dir: &Path) -> bool {
    boot_indicator_exists(metadata_dir)
}

/// Build a manager for first-stage mount. Images are forced onto the
/// local file-backed backend and mapped through the mapper handle, so the
/// engine works before any services are up.
pub fn new_first_stage_manager(
    config: EngineConfig,
    hooks: DeviceHooks,
    mapper: Arc<dyn BlockMapper>,
    metadata: Arc<dyn MetadataStore>,
) -> Result<SnapshotManager> {
    let images = Arc::new(LocalImageManager::open(&config.images_dir, mapper.clone())?);
    let mut manager = SnapshotManager::new(config, hooks, mapper, images, metadata);
    manager.set_first_stage();
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_a_single_stat() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_snapshot_manager_needed(dir.path()));
        std::fs::write(dir.path().join("snapshot-boot"), "_a").unwrap();
        assert!(is_snapshot_manager_needed(dir.path()));
    }
}
