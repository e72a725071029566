//! Layered device construction and teardown.
//!
//! For a partition `P` with an active snapshot the stack is:
//!
//! ```text
//!     [P]          two linear targets (only when snapshot_size < device_size)
//!     [P-inner]    snapshot / snapshot-merge target
//!     [P-base]     linear over P's extents in super      [P-cow]
//!                                          in-super extents + [P-cow-img] tail
//! ```
//!
//! A device carrying both a snapshot and a linear target in one table
//! crashes older kernels, so the partial-snapshot case stacks an inner
//! device instead. Everything created along the way is registered on a
//! scoped list and torn down in reverse on failure.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::cleanup::ScopedCleanup;
use crate::error::{Result, SnapshotError};
use crate::hooks::slot_number;
use crate::lock::LockedFile;
use crate::mapper::{DmTarget, SnapshotMode};
use crate::metadata::{Metadata, PartitionInfo};
use crate::state::{
    SECTOR_SIZE, SnapshotState, SnapshotStatus, UpdateState, base_device_name, cow_device_name,
    cow_image_name, inner_device_name, snapshot_device_name,
};

use super::SnapshotManager;

/// COW chunk size of the snapshot target, in sectors (4096 bytes).
pub(crate) const SNAPSHOT_CHUNK_SECTORS: u32 = 8;

/// Remaining budget for the next leg of a multi-device operation. A zero
/// `timeout` disables the budget entirely; an exhausted one fails the leg.
fn remaining_time(timeout: Duration, begin: Instant, name: &str) -> Result<Duration> {
    if timeout.is_zero() {
        return Ok(Duration::ZERO);
    }
    let elapsed = begin.elapsed();
    if elapsed >= timeout {
        tracing::error!(device = %name, ?timeout, "Mapping exceeded its time budget");
        return Err(SnapshotError::Timeout {
            name: name.to_string(),
        });
    }
    Ok(timeout - elapsed)
}

/// Linear table exposing a partition's physical extents as one device.
fn linear_table(partition: &PartitionInfo, super_device: &str) -> Vec<DmTarget> {
    let mut table = Vec::with_capacity(partition.extents.len());
    let mut logical_sector = 0u64;
    for extent in &partition.extents {
        table.push(DmTarget::Linear {
            start_sector: logical_sector,
            num_sectors: extent.num_sectors,
            backing: super_device.to_string(),
            backing_sector: extent.start_sector,
        });
        logical_sector += extent.num_sectors;
    }
    table
}

impl SnapshotManager {
    /// Map partition `name` from `metadata`, layering in a snapshot when a
    /// live status record exists. Returns `None` for zero-length
    /// partitions. Partitions re-flashed outside the updater (missing the
    /// `updated` attribute) and partitions whose merge already completed
    /// are mapped plain.
    pub(crate) fn map_partition_with_snapshot(
        &self,
        lock: &LockedFile,
        metadata: &Metadata,
        super_device: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<PathBuf>> {
        let begin = Instant::now();

        let partition = metadata.find_partition(name).ok_or_else(|| {
            SnapshotError::metadata(format!("no partition {name} in table"))
        })?;
        if partition.extents.is_empty() {
            tracing::info!(partition = %name, "Skipping zero-length logical partition");
            return Ok(None);
        }

        let live_status = self.live_snapshot_status(lock, partition)?;

        // With a snapshot, the plain device takes the -base name so the
        // outer name stays free for the snapshot stack.
        let plain_name = match live_status {
            Some(_) => base_device_name(name),
            None => name.to_string(),
        };

        let mut created = ScopedCleanup::new();

        let table = linear_table(partition, super_device);
        let budget = remaining_time(timeout, begin, name)?;
        let path = self.mapper.create(&plain_name, &table, budget)?;
        {
            let mapper = &self.mapper;
            let plain_name = plain_name.clone();
            created.push(plain_name.clone(), move || {
                mapper.delete_if_exists(&plain_name)
            });
        }

        let Some(status) = live_status else {
            created.release();
            return Ok(Some(path));
        };

        // First-stage init has no udev, so backing devices are referenced
        // by major:minor rather than by path.
        let base_device = self.mapper.get_device_string(&plain_name)?;

        let budget = remaining_time(timeout, begin, name)?;
        let cow_name = self.map_cow_devices(
            lock,
            metadata,
            super_device,
            name,
            &status,
            &mut created,
            budget,
        )?;
        let cow_device = self.mapper.get_device_string(&cow_name)?;

        let budget = remaining_time(timeout, begin, name)?;
        let path = self.map_snapshot(lock, name, &base_device, &cow_device, &status, budget)?;

        created.release();
        tracing::info!(partition = %name, path = %path.display(), "Mapped partition as snapshot device");
        Ok(Some(path))
    }

    fn live_snapshot_status(
        &self,
        lock: &LockedFile,
        partition: &PartitionInfo,
    ) -> Result<Option<SnapshotStatus>> {
        if !partition.is_updated() {
            tracing::info!(
                partition = %partition.name,
                "Detected re-flash of partition, will map without snapshot"
            );
            return Ok(None);
        }
        if !self.store.snapshot_status_exists(&partition.name) {
            return Ok(None);
        }
        let status = self.store.read_snapshot_status(lock, &partition.name)?;
        if status.state == SnapshotState::MergeCompleted {
            return Ok(None);
        }
        Ok(Some(status))
    }

    /// Map the COW backing for `name`: the image device if a file-backed
    /// share exists, and the composed `P-cow` device over the in-super
    /// extents with the image as a tail extent. Returns the name of the
    /// device to hand to the snapshot target.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn map_cow_devices<'a>(
        &'a self,
        _lock: &LockedFile,
        metadata: &Metadata,
        super_device: &str,
        name: &str,
        status: &SnapshotStatus,
        created: &mut ScopedCleanup<'a>,
        timeout: Duration,
    ) -> Result<String> {
        debug_assert!(status.has_cow(), "mapping COW devices without any COW");
        let begin = Instant::now();

        let image_name = cow_image_name(name);
        let cow_name = cow_device_name(name);

        if status.cow_file_size > 0 {
            let budget = remaining_time(timeout, begin, &image_name)?;
            self.map_cow_image(&image_name, budget)?;
            {
                let images = &self.images;
                let image_name = image_name.clone();
                created.push(image_name.clone(), move || {
                    images.unmap_image_if_exists(&image_name)
                });
            }
            // With no in-super share, the image alone is the COW device.
            if status.cow_partition_size == 0 {
                tracing::info!(partition = %name, cow = %image_name, "Mapped file-backed COW");
                return Ok(image_name);
            }
        }

        let cow_partition = metadata.find_partition(&cow_name).ok_or_else(|| {
            SnapshotError::metadata(format!("no COW partition {cow_name} in table"))
        })?;
        let mut table = linear_table(cow_partition, super_device);
        if status.cow_file_size > 0 {
            let image_device = self.mapper.get_device_string(&image_name)?;
            table.push(DmTarget::Linear {
                start_sector: status.cow_partition_size / SECTOR_SIZE,
                num_sectors: status.cow_file_size / SECTOR_SIZE,
                backing: image_device,
                backing_sector: 0,
            });
        }

        let budget = remaining_time(timeout, begin, &cow_name)?;
        self.mapper.create(&cow_name, &table, budget)?;
        {
            let mapper = &self.mapper;
            let cow_name = cow_name.clone();
            created.push(cow_name.clone(), move || mapper.delete_if_exists(&cow_name));
        }
        tracing::info!(partition = %name, cow = %cow_name, "Mapped COW device");
        Ok(cow_name)
    }

    /// Create the snapshot target over `base` and `cow`, splitting into an
    /// inner device plus a two-target linear stack when only a prefix of
    /// the device is shadowed.
    pub(crate) fn map_snapshot(
        &self,
        lock: &LockedFile,
        name: &str,
        base_device: &str,
        cow_device: &str,
        status: &SnapshotStatus,
        timeout: Duration,
    ) -> Result<PathBuf> {
        if status.state == SnapshotState::MergeCompleted {
            return Err(SnapshotError::InvalidTransition {
                op: "map_snapshot",
                state: format!("snapshot {name} already merged"),
            });
        }
        status.check_aligned()?;
        if status.snapshot_size > status.device_size {
            return Err(SnapshotError::corrupt(format!(
                "snapshot {name} shadows {} bytes of a {} byte device",
                status.snapshot_size, status.device_size
            )));
        }
        let snapshot_sectors = status.snapshot_size / SECTOR_SIZE;
        let linear_sectors = (status.device_size - status.snapshot_size) / SECTOR_SIZE;

        // Merging is a global state: once a merge has started, every
        // mapping must be a merge target, even if a previous attempt
        // stalled in MergeFailed.
        let mode = match self.store.read_update_state(lock)? {
            state @ (UpdateState::MergeCompleted | UpdateState::MergeNeedsReboot) => {
                return Err(SnapshotError::InvalidTransition {
                    op: "map_snapshot",
                    state: state.to_string(),
                });
            }
            UpdateState::Merging | UpdateState::MergeFailed => SnapshotMode::Merge,
            _ => SnapshotMode::Persistent,
        };

        let snap_name = if linear_sectors > 0 {
            inner_device_name(name)
        } else {
            name.to_string()
        };

        let table = [DmTarget::Snapshot {
            num_sectors: snapshot_sectors,
            base: base_device.to_string(),
            cow: cow_device.to_string(),
            mode,
            chunk_sectors: SNAPSHOT_CHUNK_SECTORS,
        }];
        let path = self.mapper.create(&snap_name, &table, timeout)?;

        if linear_sectors == 0 {
            return Ok(path);
        }

        let snap_device = match self.mapper.get_device_string(&snap_name) {
            Ok(device) => device,
            Err(e) => {
                let _ = self.mapper.delete_if_exists(&snap_name);
                return Err(e);
            }
        };
        let outer = [
            DmTarget::Linear {
                start_sector: 0,
                num_sectors: snapshot_sectors,
                backing: snap_device,
                backing_sector: 0,
            },
            DmTarget::Linear {
                start_sector: snapshot_sectors,
                num_sectors: linear_sectors,
                backing: base_device.to_string(),
                backing_sector: snapshot_sectors,
            },
        ];
        match self.mapper.create(name, &outer, timeout) {
            Ok(path) => Ok(path),
            Err(e) => {
                let _ = self.mapper.delete_if_exists(&snap_name);
                Err(e)
            }
        }
    }

    /// Tear the stack down in reverse: `P`, `P-inner`, the COW devices,
    /// then `P-base`.
    pub(crate) fn unmap_partition_with_snapshot(
        &self,
        lock: &LockedFile,
        name: &str,
    ) -> Result<()> {
        self.unmap_snapshot(lock, name)?;
        self.unmap_cow_devices(name)?;
        self.mapper.delete_if_exists(&base_device_name(name))?;
        Ok(())
    }

    pub(crate) fn unmap_snapshot(&self, _lock: &LockedFile, name: &str) -> Result<()> {
        self.mapper.delete_if_exists(name)?;
        self.mapper.delete_if_exists(&inner_device_name(name))?;
        Ok(())
    }

    pub(crate) fn unmap_cow_devices(&self, name: &str) -> Result<()> {
        self.mapper.delete_if_exists(&cow_device_name(name))?;
        self.images.unmap_image_if_exists(&cow_image_name(name))?;
        Ok(())
    }

    /// Replace a fully-merged snapshot stack with the plain base table, so
    /// the outer name becomes a simple linear device, then delete the
    /// inner and base devices.
    pub(crate) fn collapse_snapshot_device(
        &self,
        name: &str,
        status: &SnapshotStatus,
    ) -> Result<()> {
        let dm_name = snapshot_device_name(name, status);

        let (target_type, dm_status) = self.query_snapshot_status(&dm_name)?;
        if target_type != "snapshot-merge" {
            return Err(SnapshotError::NotMerged {
                name: name.to_string(),
            });
        }
        if dm_status.sectors_allocated != dm_status.metadata_sectors {
            tracing::error!(device = %dm_name, "Merge is unexpectedly incomplete");
            return Err(SnapshotError::NotMerged {
                name: name.to_string(),
            });
        }

        let snapshot_sectors = status.snapshot_size / SECTOR_SIZE;
        if dm_name != name {
            // Replacing the outer table, so verify it looks like the
            // two-target stack we built.
            let outer = self.mapper.get_table(name)?;
            if outer.len() != 2 || outer.iter().any(|t| t.kind != "linear") {
                return Err(SnapshotError::corrupt(format!(
                    "outer device {name} does not carry the expected two linear targets"
                )));
            }
            if outer[0].num_sectors != snapshot_sectors {
                return Err(SnapshotError::corrupt(format!(
                    "outer device {name} snapshot range has {} sectors, expected {snapshot_sectors}",
                    outer[0].num_sectors
                )));
            }
            let device_sectors = status.device_size / SECTOR_SIZE;
            let actual = outer[0].num_sectors + outer[1].num_sectors;
            if actual != device_sectors {
                return Err(SnapshotError::corrupt(format!(
                    "outer device {name} has {actual} sectors, expected {device_sectors}"
                )));
            }
        }

        // Swap in the table first-stage mount would build with no snapshot.
        let slot = slot_number(&self.hooks.slot_suffix());
        let super_device = self.hooks.super_device(slot);
        let metadata = self.metadata.read_metadata(&super_device, slot)?;
        let partition = metadata.find_partition(name).ok_or_else(|| {
            SnapshotError::metadata(format!("no partition {name} in table"))
        })?;
        let table = linear_table(partition, &super_device);
        self.mapper.load_table_and_activate(name, &table)?;

        // The inner device must go now or its COW cannot be reclaimed
        // until after a reboot.
        if dm_name != name {
            self.mapper.delete_if_exists(&dm_name)?;
        }

        // The base device is merely unused at this point; failing to
        // delete it does not block cleanup.
        if let Err(e) = self.mapper.delete_if_exists(&base_device_name(name)) {
            tracing::error!(partition = %name, error = %e, "Unable to delete base device after collapse");
        }
        tracing::info!(partition = %name, "Collapsed snapshot device");
        Ok(())
    }
}
