//! The snapshot manager: the persistent update-lifecycle state machine.
//!
//! Three callers share this engine through the on-disk store: the update
//! client while staging, first-stage boot while an update is pending, and
//! the post-boot daemon driving the merge. They coordinate purely through
//! file locks and file contents; within one process every operation runs
//! to completion on the calling thread.

mod composer;
mod merge;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cleanup::ScopedCleanup;
use crate::config::EngineConfig;
use crate::error::{Result, SnapshotError};
use crate::hooks::{DeviceHooks, slot_number};
use crate::images::ImageManager;
use crate::lock::{self, LockedFile};
use crate::manifest::UpdateManifest;
use crate::mapper::BlockMapper;
use crate::metadata::{COW_GROUP_NAME, MetadataStore};
use crate::metadata_updater::MetadataUpdater;
use crate::planner::plan_partition_cow;
use crate::state::{
    SnapshotState, SnapshotStatus, UpdateState, cow_device_name, cow_image_name,
};
use crate::store::StatusStore;

pub struct SnapshotManager {
    config: EngineConfig,
    hooks: DeviceHooks,
    mapper: Arc<dyn BlockMapper>,
    images: Arc<dyn ImageManager>,
    metadata: Arc<dyn MetadataStore>,
    store: StatusStore,
    /// Set for first-stage instances, where images must be mapped through
    /// the mapper handle because no device service is running yet.
    first_stage: bool,
}

impl SnapshotManager {
    pub fn new(
        config: EngineConfig,
        hooks: DeviceHooks,
        mapper: Arc<dyn BlockMapper>,
        images: Arc<dyn ImageManager>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let store = StatusStore::new(&config.metadata_dir);
        SnapshotManager {
            config,
            hooks,
            mapper,
            images,
            metadata,
            store,
            first_stage: false,
        }
    }

    pub(crate) fn set_first_stage(&mut self) {
        self.first_stage = true;
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub(crate) fn lock_exclusive(&self) -> Result<LockedFile> {
        lock::lock_exclusive(&self.store.state_file_path())
    }

    pub(crate) fn lock_shared(&self) -> Result<LockedFile> {
        lock::lock_shared(&self.store.state_file_path())
    }

    /// Begin an update. A stale `Initiated` update, or an `Unverified` one
    /// that was never booted into (boot indicator equal to the current
    /// slot, or unreadable), is discarded first. Any other non-`None`
    /// state means an update is still in flight and the call is refused.
    pub fn begin_update(&self) -> Result<()> {
        let lock = self.lock_exclusive()?;
        let state = self.store.read_update_state(&lock)?;
        match state {
            UpdateState::None => {}
            UpdateState::Initiated => {
                tracing::info!("Discarding stale initiated update");
                self.remove_all_update_state(&lock)?;
            }
            UpdateState::Unverified => {
                let current = self.hooks.slot_suffix();
                match self.store.read_boot_indicator() {
                    Some(old_slot) if old_slot != current => {
                        return Err(SnapshotError::InvalidTransition {
                            op: "begin_update",
                            state: state.to_string(),
                        });
                    }
                    indicator => {
                        if indicator.is_none() {
                            tracing::warn!("Boot indicator unreadable, proceeding to discard update");
                        } else {
                            tracing::info!("Discarding never-booted update");
                        }
                        self.remove_all_update_state(&lock)?;
                    }
                }
            }
            _ => {
                return Err(SnapshotError::InvalidTransition {
                    op: "begin_update",
                    state: state.to_string(),
                });
            }
        }
        self.store.write_update_state(&lock, UpdateState::Initiated)
    }

    /// Cancel an update, deleting all snapshots. Allowed until a merge
    /// starts; a no-op when no update exists.
    pub fn cancel_update(&self) -> Result<()> {
        let lock = self.lock_exclusive()?;
        let state = self.store.read_update_state(&lock)?;
        match state {
            UpdateState::None => Ok(()),
            UpdateState::Initiated | UpdateState::Unverified => {
                tracing::info!(state = %state, "Canceling update");
                self.remove_all_update_state(&lock)
            }
            _ => Err(SnapshotError::InvalidTransition {
                op: "cancel_update",
                state: state.to_string(),
            }),
        }
    }

    /// Mark snapshot writes as complete: record the slot we are leaving in
    /// the boot indicator and move to `Unverified`. Idempotent once there.
    pub fn finished_snapshot_writes(&self) -> Result<()> {
        let lock = self.lock_exclusive()?;
        let state = self.store.read_update_state(&lock)?;
        if state == UpdateState::Unverified {
            tracing::info!("Snapshot writes were already marked finished");
            return Ok(());
        }
        if state != UpdateState::Initiated {
            return Err(SnapshotError::InvalidTransition {
                op: "finished_snapshot_writes",
                state: state.to_string(),
            });
        }
        // The indicator doubles as a cheap first-stage probe and as the
        // rollback detector: it stores the slot we booted from.
        self.store
            .write_boot_indicator(&lock, &self.hooks.slot_suffix())?;
        self.store.write_update_state(&lock, UpdateState::Unverified)
    }

    /// Create all COW backing for the manifest's target partitions: rewrite
    /// the target slot's partition table, size each partition's COW, carve
    /// in-super COW partitions, allocate file-backed images, and initialize
    /// every COW store. Any failure rolls back everything created here.
    pub fn create_update_snapshots(&self, manifest: &UpdateManifest) -> Result<()> {
        let lock = self.lock_exclusive()?;
        let state = self.store.read_update_state(&lock)?;
        if state != UpdateState::Initiated {
            return Err(SnapshotError::InvalidTransition {
                op: "create_update_snapshots",
                state: state.to_string(),
            });
        }
        if self.hooks.is_overlayfs_setup() {
            return Err(SnapshotError::metadata(
                "scratch overlays are set up over the system partitions; \
                 tear them down and retry",
            ));
        }

        let current_suffix = self.hooks.slot_suffix();
        let current_slot = slot_number(&current_suffix);
        let target_suffix = self.hooks.other_slot_suffix();
        let target_slot = slot_number(&target_suffix);
        let current_super = self.hooks.super_device(current_slot);

        let current_metadata = self.metadata.read_metadata(&current_super, current_slot)?;
        let mut target_builder =
            self.metadata
                .new_metadata_for_update(&current_super, current_slot, target_slot)?;

        MetadataUpdater::new(manifest, &target_suffix).update(&mut target_builder)?;
        target_builder.add_group(COW_GROUP_NAME, 0)?;

        let mut created = ScopedCleanup::new();
        let mut planned: Vec<(String, SnapshotStatus)> = Vec::new();

        for name in target_builder.partitions_with_suffix(&target_suffix) {
            let update = manifest
                .partitions
                .iter()
                .find(|p| format!("{}{}", p.partition_name, target_suffix) == name);

            let plan = plan_partition_cow(&target_builder, &current_metadata, &name, update)?;

            // Replace any stale snapshot from a previous attempt.
            self.delete_snapshot(&lock, &name)?;

            if !plan.needs_snapshot() {
                tracing::info!(partition = %name, "Nothing to snapshot for partition");
                continue;
            }

            self.create_snapshot(&lock, &name, plan.status.clone())?;
            {
                let lock = &lock;
                let name = name.clone();
                created.push(name.clone(), move || self.delete_snapshot(lock, &name));
            }

            if plan.status.cow_partition_size > 0 {
                let cow_name = cow_device_name(&name);
                target_builder.add_partition(&cow_name, COW_GROUP_NAME, 0)?;
                target_builder.resize_partition(
                    &cow_name,
                    plan.status.cow_partition_size,
                    Some(&plan.usable_regions),
                )?;
            }
            if plan.status.cow_file_size > 0 {
                self.create_cow_image(&lock, &name)?;
            }

            tracing::info!(
                partition = %name,
                device_size = plan.status.device_size,
                snapshot_size = plan.status.snapshot_size,
                cow_partition_size = plan.status.cow_partition_size,
                cow_file_size = plan.status.cow_file_size,
                "Created snapshot"
            );
            planned.push((name, plan.status));
        }

        let exported = target_builder.export();
        let target_super = self.hooks.super_device(target_slot);

        // The kernel treats a COW store with a zeroed header as fresh. Map
        // each COW stack once, zero it, and let the scoped list unmap it.
        for (name, status) in &planned {
            self.unmap_partition_with_snapshot(&lock, name)?;

            let mut cow_devices = ScopedCleanup::new();
            let cow_name = self.map_cow_devices(
                &lock,
                &exported,
                &target_super,
                name,
                status,
                &mut cow_devices,
                self.config.mapping_timeout,
            )?;
            let cow_path = self.mapper.get_device_path(&cow_name)?;
            initialize_cow_store(&cow_name, &cow_path)?;
        }

        self.metadata
            .update_partition_table(&target_super, &exported, target_slot)?;

        created.release();
        tracing::info!(target_slot = %target_suffix, "Created all snapshots for target slot");
        Ok(())
    }

    /// Map one target partition for the updater to write, tearing down any
    /// stale mapping first. Requires state `Initiated`.
    pub fn map_update_snapshot(&self, partition_name: &str) -> Result<PathBuf> {
        let lock = self.lock_exclusive()?;
        let state = self.store.read_update_state(&lock)?;
        if state != UpdateState::Initiated {
            return Err(SnapshotError::InvalidTransition {
                op: "map_update_snapshot",
                state: state.to_string(),
            });
        }
        self.unmap_partition_with_snapshot(&lock, partition_name)?;

        let target_slot = slot_number(&self.hooks.other_slot_suffix());
        let target_super = self.hooks.super_device(target_slot);
        let metadata = self.metadata.read_metadata(&target_super, target_slot)?;
        self.map_partition_with_snapshot(
            &lock,
            &metadata,
            &target_super,
            partition_name,
            self.config.mapping_timeout,
        )?
        .ok_or_else(|| {
            SnapshotError::metadata(format!("partition {partition_name} has no extents"))
        })
    }

    /// The reverse of [`map_update_snapshot`](Self::map_update_snapshot).
    pub fn unmap_update_snapshot(&self, partition_name: &str) -> Result<()> {
        let lock = self.lock_exclusive()?;
        self.unmap_partition_with_snapshot(&lock, partition_name)
    }

    /// First-stage entry point: map every partition of the current slot,
    /// with snapshots layered in where a live status record exists.
    pub fn create_logical_and_snapshot_partitions(&self, super_device: &str) -> Result<()> {
        tracing::info!("Creating logical partitions with snapshots as needed");
        let lock = self.lock_exclusive()?;

        let slot = slot_number(&self.hooks.slot_suffix());
        let metadata = self.metadata.read_metadata(super_device, slot)?;

        for partition in &metadata.partitions {
            if partition.group == COW_GROUP_NAME {
                tracing::info!(partition = %partition.name, "Skipping COW group partition");
                continue;
            }
            self.map_partition_with_snapshot(
                &lock,
                &metadata,
                super_device,
                &partition.name,
                self.config.mapping_timeout,
            )?;
        }
        Ok(())
    }

    /// Whether first-stage mount must map snapshots rather than plain
    /// partitions. True only when we rebooted into the new slot with an
    /// update still in flight.
    pub fn need_snapshots_in_first_stage_mount(&self) -> bool {
        let Some(old_slot) = self.store.read_boot_indicator() else {
            return false;
        };
        if self.hooks.slot_suffix() == old_slot {
            tracing::info!("Detected slot rollback, will not mount snapshots");
            return false;
        }
        let lock = match self.lock_shared() {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!(error = %e, "Could not read update state for first-stage mount");
                return false;
            }
        };
        matches!(
            self.store.read_update_state(&lock),
            Ok(UpdateState::Unverified) | Ok(UpdateState::Merging) | Ok(UpdateState::MergeFailed)
        )
    }

    /// Current update state. When `progress` is supplied it is filled with
    /// 100.0 in `MergeCompleted`, a snapshot-size-weighted merge estimate
    /// while `Merging`, and 0.0 otherwise.
    pub fn get_update_state(&self, progress: Option<&mut f64>) -> Result<UpdateState> {
        if !self.store.state_file_path().exists() {
            if let Some(p) = progress {
                *p = 0.0;
            }
            return Ok(UpdateState::None);
        }
        let lock = self.lock_shared()?;
        let state = self.store.read_update_state(&lock)?;
        if let Some(p) = progress {
            *p = match state {
                UpdateState::MergeCompleted => 100.0,
                UpdateState::Merging => self.merge_progress(&lock),
                _ => 0.0,
            };
        }
        Ok(state)
    }

    fn merge_progress(&self, lock: &LockedFile) -> f64 {
        let snapshots = match self.store.list_snapshots(lock) {
            Ok(names) => names,
            Err(_) => return 0.0,
        };
        let mut weighted = 0.0;
        let mut total = 0.0;
        for name in snapshots {
            let Ok(status) = self.store.read_snapshot_status(lock, &name) else {
                continue;
            };
            let weight = status.snapshot_size as f64;
            let fraction = merge_fraction(&status);
            weighted += weight * fraction;
            total += weight;
        }
        if total > 0.0 {
            100.0 * weighted / total
        } else {
            0.0
        }
    }

    /// Record a new snapshot. Sizes must be sector-aligned and the
    /// snapshotted prefix must fit the device.
    pub(crate) fn create_snapshot(
        &self,
        lock: &LockedFile,
        name: &str,
        mut status: SnapshotStatus,
    ) -> Result<()> {
        lock.ensure_exclusive("create_snapshot")?;
        status.check_aligned()?;
        if status.snapshot_size > status.device_size {
            return Err(SnapshotError::corrupt(format!(
                "snapshot {name} shadows {} bytes of a {} byte device",
                status.snapshot_size, status.device_size
            )));
        }
        status.state = SnapshotState::Created;
        status.sectors_allocated = 0;
        status.metadata_sectors = 0;
        self.store.write_snapshot_status(lock, name, &status)
    }

    /// Allocate the file-backed COW image sized by the snapshot's record.
    pub(crate) fn create_cow_image(&self, lock: &LockedFile, name: &str) -> Result<()> {
        lock.ensure_exclusive("create_cow_image")?;
        let status = self.store.read_snapshot_status(lock, name)?;
        self.images
            .create_backing_image(&cow_image_name(name), status.cow_file_size)
    }

    /// Remove a snapshot's COW backing and status record. The snapshot
    /// device itself must already be unmapped.
    pub(crate) fn delete_snapshot(&self, lock: &LockedFile, name: &str) -> Result<()> {
        lock.ensure_exclusive("delete_snapshot")?;
        self.unmap_cow_devices(name)?;
        let image = cow_image_name(name);
        if self.images.backing_image_exists(&image) {
            self.images.delete_backing_image(&image)?;
        }
        self.store.remove_snapshot_status(lock, name)
    }

    /// Unmap and delete every known snapshot. Keeps going after individual
    /// failures and reports the first one.
    pub(crate) fn remove_all_snapshots(&self, lock: &LockedFile) -> Result<()> {
        let mut first_error = None;
        for name in self.store.list_snapshots(lock)? {
            let result = self
                .unmap_partition_with_snapshot(lock, &name)
                .and_then(|()| self.delete_snapshot(lock, &name));
            if let Err(e) = result {
                tracing::error!(partition = %name, error = %e, "Failed to remove snapshot");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Discard every update artifact and return to `None`.
    pub(crate) fn remove_all_update_state(&self, lock: &LockedFile) -> Result<()> {
        self.remove_all_snapshots(lock)?;
        self.store.remove_boot_indicator();
        // If this fails we keep retrying on later boots or updates until it
        // finally lands.
        self.store.write_update_state(lock, UpdateState::None)
    }

    /// Write a human-readable account of the store. Deliberately lock-free:
    /// dumping is for debugging and may race.
    pub fn dump(&self, out: &mut dyn std::io::Write) -> Result<()> {
        let file = lock::open_unlocked(&self.store.state_file_path())?;
        let mut ok = true;

        writeln!(out, "Update state: {}", self.store.read_update_state(&file)?)
            .map_err(|e| SnapshotError::corrupt(format!("dump write: {e}")))?;

        if let Some(indicator) = self.store.read_boot_indicator() {
            writeln!(out, "Boot indicator: old slot = {indicator}")
                .map_err(|e| SnapshotError::corrupt(format!("dump write: {e}")))?;
        }

        for name in self.store.list_snapshots(&file)? {
            writeln!(out, "Snapshot: {name}")
                .map_err(|e| SnapshotError::corrupt(format!("dump write: {e}")))?;
            let status = match self.store.read_snapshot_status(&file, &name) {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(partition = %name, error = %e, "Unreadable snapshot status");
                    ok = false;
                    continue;
                }
            };
            let fields = [
                ("state", status.state.to_string()),
                ("device size (bytes)", status.device_size.to_string()),
                ("snapshot size (bytes)", status.snapshot_size.to_string()),
                (
                    "cow partition size (bytes)",
                    status.cow_partition_size.to_string(),
                ),
                ("cow file size (bytes)", status.cow_file_size.to_string()),
                ("allocated sectors", status.sectors_allocated.to_string()),
                ("metadata sectors", status.metadata_sectors.to_string()),
            ];
            for (label, value) in fields {
                writeln!(out, "    {label}: {value}")
                    .map_err(|e| SnapshotError::corrupt(format!("dump write: {e}")))?;
            }
        }
        if !ok {
            return Err(SnapshotError::corrupt("one or more snapshot records unreadable"));
        }
        Ok(())
    }

    pub(crate) fn map_cow_image(&self, name: &str, timeout: Duration) -> Result<PathBuf> {
        if self.first_stage {
            self.images.map_image_with_mapper(self.mapper.as_ref(), name)
        } else {
            self.images.map_image(name, timeout)
        }
    }
}

/// Estimated completion of one snapshot's merge, in [0, 1].
///
/// `sectors_allocated` climbs toward `metadata_sectors` as the kernel
/// works through the store; the two are equal exactly when the merge is
/// done, so their ratio is the per-snapshot completion.
fn merge_fraction(status: &SnapshotStatus) -> f64 {
    if status.metadata_sectors == 0 {
        return 0.0;
    }
    if status.sectors_allocated >= status.metadata_sectors {
        return 1.0;
    }
    status.sectors_allocated as f64 / status.metadata_sectors as f64
}

/// Zero the first 32 bits of a COW device so the kernel treats the store
/// as a fresh snapshot rather than resuming (or rejecting) stale contents.
fn initialize_cow_store(name: &str, path: &std::path::Path) -> Result<()> {
    tracing::info!(device = %name, path = %path.display(), "Zero-filling COW store header");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| {
            SnapshotError::image(name, "initialize-cow", anyhow::anyhow!("open {}: {e}", path.display()))
        })?;
    file.write_all(&[0u8; 4]).map_err(|e| {
        SnapshotError::image(name, "initialize-cow", anyhow::anyhow!("write {}: {e}", path.display()))
    })?;
    file.sync_all().map_err(|e| {
        SnapshotError::image(name, "initialize-cow", anyhow::anyhow!("sync {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests;
