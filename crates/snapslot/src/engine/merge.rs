//! Merge lifecycle: initiation, cooperative polling, per-target state
//! decisions, and completion cleanup.
//!
//! A merge always runs to some terminal outcome across reboots: once the
//! state is `Merging`, every boot maps merge targets and every poll tries
//! to make progress. Transient failures park the state at `MergeFailed`
//! so the next poll or boot can retry; cleanup failures park it at
//! `MergeNeedsReboot`.

use std::time::Duration;

use crate::error::{Result, SnapshotError};
use crate::hooks::slot_number;
use crate::lock::LockedFile;
use crate::mapper::{DmTarget, SnapshotMode, SnapshotTargetStatus, parse_snapshot_status};
use crate::state::{SnapshotState, SnapshotStatus, UpdateState, snapshot_device_name};

use super::SnapshotManager;
use super::composer::SNAPSHOT_CHUNK_SECTORS;

/// Pause between merge polls. Merge completion is not time sensitive, so
/// the polling frequency is low.
const MERGE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Which cleanup phase failed after a completed merge. Collapse failures
/// heal on the next reboot; deletion failures need another retry cycle.
enum MergeCleanupError {
    Collapse(SnapshotError),
    Delete(SnapshotError),
}

impl SnapshotManager {
    /// Start merging every snapshot. Requires a verified update: state
    /// `Unverified` and the device booted into the new slot. Per-snapshot
    /// rewrite failures do not fail the call; they park the update at
    /// `MergeFailed` so later polls retry, because a merge, once started,
    /// must be driven to completion.
    pub fn initiate_merge(&self) -> Result<()> {
        let lock = self.lock_exclusive()?;
        let state = self.store.read_update_state(&lock)?;
        if state != UpdateState::Unverified {
            return Err(SnapshotError::InvalidTransition {
                op: "initiate_merge",
                state: state.to_string(),
            });
        }

        let old_slot = self.store.read_boot_indicator().ok_or_else(|| {
            SnapshotError::corrupt("cannot determine the previous slot; aborting merge")
        })?;
        if self.hooks.slot_suffix() == old_slot {
            tracing::error!(slot = %old_slot, "Device cannot merge while booted into the old slot");
            return Err(SnapshotError::RollbackDetected);
        }

        let snapshots = self.store.list_snapshots(&lock)?;

        // Everything merges at the same time, so every snapshot must be
        // mapped. They should have been mapped during first-stage boot.
        for name in &snapshots {
            if !self.mapper.device_exists(name) {
                return Err(SnapshotError::InvalidTransition {
                    op: "initiate_merge",
                    state: format!("snapshot device {name} is not mapped"),
                });
            }
        }

        // Point of no return.
        self.store.write_update_state(&lock, UpdateState::Merging)?;

        let mut rewrote_all = true;
        for name in &snapshots {
            if let Err(e) = self.switch_snapshot_to_merge(&lock, name) {
                tracing::error!(partition = %name, error = %e, "Failed to switch snapshot to a merge target");
                rewrote_all = false;
            }
        }

        // A partial switch is pre-emptively marked failed; polling will
        // acknowledge it and the next boot retries the rest.
        if !rewrote_all {
            self.store
                .write_update_state(&lock, UpdateState::MergeFailed)?;
        }

        Ok(())
    }

    /// Rewrite one snapshot's table to `snapshot-merge` in place and move
    /// its record to `Merging`. Once the table swap lands the switch has
    /// happened; failures to record counters are informational only.
    fn switch_snapshot_to_merge(&self, lock: &LockedFile, name: &str) -> Result<()> {
        let mut status = self.store.read_snapshot_status(lock, name)?;
        if status.state != SnapshotState::Created {
            tracing::warn!(partition = %name, state = %status.state, "Snapshot has unexpected state");
        }

        let dm_name = snapshot_device_name(name, &status);
        self.rewrite_snapshot_device_table(&dm_name)?;

        status.state = SnapshotState::Merging;
        match self.query_snapshot_status(&dm_name) {
            Ok((_, dm_status)) => {
                status.sectors_allocated = dm_status.sectors_allocated;
                status.metadata_sectors = dm_status.metadata_sectors;
            }
            Err(e) => {
                tracing::error!(device = %dm_name, error = %e, "Could not query merge status for snapshot");
            }
        }
        if let Err(e) = self.store.write_snapshot_status(lock, name, &status) {
            tracing::error!(partition = %name, error = %e, "Could not update status file for snapshot");
        }
        Ok(())
    }

    /// Load-and-resume the merge table over the existing snapshot device,
    /// reusing its current base and COW devices.
    fn rewrite_snapshot_device_table(&self, dm_name: &str) -> Result<()> {
        let table = self.mapper.get_table(dm_name)?;
        if table.len() != 1 || table[0].kind != "snapshot" {
            return Err(SnapshotError::mapper(
                dm_name,
                "rewrite",
                anyhow::anyhow!("unexpected device table for snapshot"),
            ));
        }
        let (base, cow) = table[0].snapshot_devices()?;
        let merge_table = [DmTarget::Snapshot {
            num_sectors: table[0].num_sectors,
            base,
            cow,
            mode: SnapshotMode::Merge,
            chunk_sectors: SNAPSHOT_CHUNK_SECTORS,
        }];
        self.mapper.load_table_and_activate(dm_name, &merge_table)?;
        tracing::info!(device = %dm_name, "Switched snapshot device to a merge target");
        Ok(())
    }

    /// Drive the merge to a resting state: poll every two seconds while
    /// anything is still merging, then return the outcome. `MergeFailed`
    /// is acknowledged (persisted) before returning; a cancelled update
    /// has already been cleaned up by the time this returns.
    pub fn process_update_state(&self) -> Result<UpdateState> {
        loop {
            let state = self.check_merge_state()?;
            if state == UpdateState::MergeFailed {
                self.acknowledge_merge_failure();
            }
            if state != UpdateState::Merging {
                return Ok(state);
            }
            std::thread::sleep(MERGE_POLL_INTERVAL);
        }
    }

    fn check_merge_state(&self) -> Result<UpdateState> {
        let lock = self.lock_exclusive()?;
        let state = self.check_merge_state_locked(&lock)?;
        match state {
            UpdateState::MergeCompleted => {
                // Inside the same lock; failures are acknowledged without
                // it, since the lock itself may be what failed.
                self.acknowledge_merge_success(&lock)?;
            }
            UpdateState::Cancelled => {
                self.remove_all_update_state(&lock)?;
            }
            _ => {}
        }
        Ok(state)
    }

    fn check_merge_state_locked(&self, lock: &LockedFile) -> Result<UpdateState> {
        let state = self.store.read_update_state(lock)?;
        match state {
            // States that cannot progress propagate verbatim; races
            // between two pollers are harmless.
            UpdateState::None | UpdateState::MergeCompleted => return Ok(state),

            UpdateState::Merging | UpdateState::MergeNeedsReboot | UpdateState::MergeFailed => {}

            // Cancellation is normally detected through the merge poll
            // below, but an update that never started merging has to be
            // checked here.
            UpdateState::Unverified => {
                if self.handle_cancelled_update(lock)? {
                    return Ok(UpdateState::Cancelled);
                }
                return Ok(state);
            }

            _ => return Ok(state),
        }

        let snapshots = self.store.list_snapshots(lock)?;

        let mut merging = false;
        let mut failed = false;
        let mut needs_reboot = false;
        let mut cancelled = false;
        for name in &snapshots {
            match self.check_target_merge_state(lock, name) {
                UpdateState::Merging => merging = true,
                UpdateState::MergeFailed => failed = true,
                UpdateState::MergeNeedsReboot => needs_reboot = true,
                UpdateState::Cancelled => cancelled = true,
                UpdateState::MergeCompleted => {}
                other => {
                    tracing::error!(partition = %name, state = %other, "Unexpected per-snapshot merge state");
                    failed = true;
                }
            }
        }

        // Merging wins over everything else: keep polling until nothing is
        // merging, so every slow partition gets its chance to finish
        // before a global failure is declared.
        if merging {
            return Ok(UpdateState::Merging);
        }
        if failed {
            // Acknowledged by the caller, not here: there are many
            // drop-out paths into failure.
            return Ok(UpdateState::MergeFailed);
        }
        if needs_reboot {
            self.store
                .write_update_state(lock, UpdateState::MergeNeedsReboot)?;
            return Ok(UpdateState::MergeNeedsReboot);
        }
        if cancelled {
            // The base partition changed behind the updater's back and the
            // snapshot is gone; treat the whole update as cancelled.
            return Ok(UpdateState::Cancelled);
        }
        Ok(UpdateState::MergeCompleted)
    }

    /// Decide one snapshot's merge state. Local failures never abort the
    /// update; they degrade to `MergeFailed` so later polls can retry.
    fn check_target_merge_state(&self, lock: &LockedFile, name: &str) -> UpdateState {
        let snapshot_status = match self.store.read_snapshot_status(lock, name) {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(partition = %name, error = %e, "Unreadable snapshot status");
                return UpdateState::MergeFailed;
            }
        };
        let dm_name = snapshot_device_name(name, &snapshot_status);

        if !self.is_snapshot_device(&dm_name) {
            if self.is_cancelled_snapshot(name) {
                if let Err(e) = self.delete_snapshot(lock, name) {
                    tracing::error!(partition = %name, error = %e, "Failed to delete cancelled snapshot");
                }
                return UpdateState::Cancelled;
            }

            // A previous poll decided the merge was complete but could not
            // collapse the stack. After a reboot the device is a plain
            // linear target, so give cleanup another try; best effort.
            if snapshot_status.state == SnapshotState::MergeCompleted {
                if let Err(e) = self.on_snapshot_merge_complete(lock, name, &snapshot_status) {
                    let (phase, e) = match e {
                        MergeCleanupError::Collapse(e) => ("collapse", e),
                        MergeCleanupError::Delete(e) => ("delete", e),
                    };
                    tracing::warn!(partition = %name, phase, error = %e, "Deferred snapshot cleanup still failing");
                }
                return UpdateState::MergeCompleted;
            }

            tracing::error!(device = %dm_name, "Expected snapshot or snapshot-merge device");
            return UpdateState::MergeFailed;
        }

        let (target_type, dm_status) = match self.query_snapshot_status(&dm_name) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(device = %dm_name, error = %e, "Could not query snapshot status");
                return UpdateState::MergeFailed;
            }
        };
        if target_type != "snapshot-merge" {
            // The rewrite in initiate_merge must have failed for this
            // device; first-stage boot would have built a merge target.
            tracing::error!(partition = %name, target_type = %target_type, "Snapshot has incorrect target type");
            return UpdateState::MergeFailed;
        }

        if dm_status.sectors_allocated != dm_status.metadata_sectors {
            if snapshot_status.state == SnapshotState::MergeCompleted {
                tracing::error!(partition = %name, "Snapshot is merging after being marked merge-complete");
                return UpdateState::MergeFailed;
            }
            return UpdateState::Merging;
        }

        // Record completion before cleanup, so no matter which part of
        // cleanup fails, the next boot will not build another snapshot
        // device for this partition.
        let mut snapshot_status = snapshot_status;
        snapshot_status.state = SnapshotState::MergeCompleted;
        snapshot_status.sectors_allocated = dm_status.sectors_allocated;
        snapshot_status.metadata_sectors = dm_status.metadata_sectors;
        if let Err(e) = self
            .store
            .write_snapshot_status(lock, name, &snapshot_status)
        {
            tracing::error!(partition = %name, error = %e, "Could not record merge completion");
            return UpdateState::MergeFailed;
        }
        match self.on_snapshot_merge_complete(lock, name, &snapshot_status) {
            Ok(()) => UpdateState::MergeCompleted,
            Err(MergeCleanupError::Collapse(e)) => {
                tracing::error!(partition = %name, error = %e, "Unable to collapse snapshot");
                UpdateState::MergeNeedsReboot
            }
            Err(MergeCleanupError::Delete(e)) => {
                tracing::error!(partition = %name, error = %e, "Could not delete snapshot");
                UpdateState::MergeFailed
            }
        }
    }

    /// Collapse the device stack (when it still exists) and destroy the
    /// snapshot's COW backing and record.
    fn on_snapshot_merge_complete(
        &self,
        lock: &LockedFile,
        name: &str,
        status: &SnapshotStatus,
    ) -> std::result::Result<(), MergeCleanupError> {
        let dm_name = snapshot_device_name(name, status);
        if self.is_snapshot_device(&dm_name) {
            // Re-verify before replacing any tables.
            let (target_type, dm_status) = self
                .query_snapshot_status(&dm_name)
                .map_err(MergeCleanupError::Collapse)?;
            if target_type != "snapshot-merge" {
                return Err(MergeCleanupError::Collapse(SnapshotError::NotMerged {
                    name: name.to_string(),
                }));
            }
            if dm_status.sectors_allocated != dm_status.metadata_sectors {
                return Err(MergeCleanupError::Collapse(SnapshotError::NotMerged {
                    name: name.to_string(),
                }));
            }
            self.collapse_snapshot_device(name, status)
                .map_err(MergeCleanupError::Collapse)?;
            // Collapsing implicitly unmapped the snapshot.
        }

        self.delete_snapshot(lock, name)
            .map_err(MergeCleanupError::Delete)?;
        Ok(())
    }

    /// Detect a rollback: booting with the boot indicator equal to the
    /// current slot means the update was abandoned. Cleans up and reports
    /// whether it fired.
    fn handle_cancelled_update(&self, lock: &LockedFile) -> Result<bool> {
        let Some(old_slot) = self.store.read_boot_indicator() else {
            tracing::error!("Unable to read the boot indicator");
            return Ok(false);
        };
        if self.hooks.slot_suffix() != old_slot {
            // Booted into the target slot: the update is simply pending.
            return Ok(false);
        }

        // Either the bootloader rolled back, someone ran set_active, or
        // this was called prematurely. All are treated as rollback.
        tracing::info!("Detected rollback into the old slot, discarding update");
        self.remove_all_update_state(lock)?;
        Ok(true)
    }

    /// Whether the target-slot partition was re-flashed outside the
    /// updater (its `updated` attribute cleared).
    fn is_cancelled_snapshot(&self, name: &str) -> bool {
        let slot = slot_number(&self.hooks.slot_suffix());
        let super_device = self.hooks.super_device(slot);
        let metadata = match self.metadata.read_metadata(&super_device, slot) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::error!(error = %e, "Could not read partition metadata");
                return false;
            }
        };
        match metadata.find_partition(name) {
            Some(partition) => !partition.is_updated(),
            None => false,
        }
    }

    pub(crate) fn acknowledge_merge_success(&self, lock: &LockedFile) -> Result<()> {
        self.remove_all_update_state(lock)
    }

    /// Park the update at `MergeFailed` unless a racing poller already
    /// moved it somewhere else.
    pub(crate) fn acknowledge_merge_failure(&self) {
        tracing::error!("Merge could not be completed and will be marked as failed");
        let lock = match self.lock_exclusive() {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!(error = %e, "Could not lock state to acknowledge merge failure");
                return;
            }
        };
        match self.store.read_update_state(&lock) {
            Ok(UpdateState::Merging) | Ok(UpdateState::MergeNeedsReboot) => {
                if let Err(e) = self.store.write_update_state(&lock, UpdateState::MergeFailed) {
                    tracing::error!(error = %e, "Could not persist merge failure");
                }
            }
            _ => {}
        }
    }

    /// Whether `dm_name` is an active single-target snapshot or
    /// snapshot-merge device.
    pub(crate) fn is_snapshot_device(&self, dm_name: &str) -> bool {
        if !self.mapper.device_exists(dm_name) {
            return false;
        }
        match self.mapper.get_status(dm_name) {
            Ok(targets) => {
                targets.len() == 1
                    && (targets[0].kind == "snapshot" || targets[0].kind == "snapshot-merge")
            }
            Err(_) => false,
        }
    }

    /// Target type and decoded counters of a snapshot device.
    pub(crate) fn query_snapshot_status(
        &self,
        dm_name: &str,
    ) -> Result<(String, SnapshotTargetStatus)> {
        let targets = self.mapper.get_status(dm_name)?;
        if targets.len() != 1 {
            return Err(SnapshotError::mapper(
                dm_name,
                "status",
                anyhow::anyhow!("expected a single target, got {}", targets.len()),
            ));
        }
        let target = &targets[0];
        if target.kind != "snapshot" && target.kind != "snapshot-merge" {
            return Err(SnapshotError::mapper(
                dm_name,
                "status",
                anyhow::anyhow!("device is a {} target, not a snapshot", target.kind),
            ));
        }
        let status = parse_snapshot_status(&target.status)?;
        Ok((target.kind.clone(), status))
    }
}
