//! Update and snapshot state records.
//!
//! The on-disk representation is deliberately primitive: single-line
//! whitespace-separated tokens, so first-stage boot can read them with
//! nothing but a file read and a split. The token values are part of the
//! persisted format and must not change.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SnapshotError};

/// Sector size used for all alignment checks, in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Global state of the update lifecycle, persisted as the sole content of
/// the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// No update or merge is in progress.
    None,
    /// An update is applying; snapshots may already exist.
    Initiated,
    /// An update is staged but has not been booted into yet.
    Unverified,
    /// The kernel is merging snapshots in the background.
    Merging,
    /// Merging finished but cleanup needs another reboot to complete.
    MergeNeedsReboot,
    /// Merging is complete and needs to be acknowledged.
    MergeCompleted,
    /// Merging failed; the next poll or boot will retry.
    MergeFailed,
    /// The update was implicitly cancelled by a rollback or an external
    /// flash. Only ever returned transiently, never persisted.
    Cancelled,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            UpdateState::None => "none",
            UpdateState::Initiated => "initiated",
            UpdateState::Unverified => "unverified",
            UpdateState::Merging => "merging",
            UpdateState::MergeNeedsReboot => "merge-needs-reboot",
            UpdateState::MergeCompleted => "merge-completed",
            UpdateState::MergeFailed => "merge-failed",
            UpdateState::Cancelled => "cancelled",
        };
        f.write_str(token)
    }
}

impl FromStr for UpdateState {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        // An empty state file is a fresh install.
        match s.trim() {
            "" | "none" => Ok(UpdateState::None),
            "initiated" => Ok(UpdateState::Initiated),
            "unverified" => Ok(UpdateState::Unverified),
            "merging" => Ok(UpdateState::Merging),
            "merge-needs-reboot" => Ok(UpdateState::MergeNeedsReboot),
            "merge-completed" => Ok(UpdateState::MergeCompleted),
            "merge-failed" => Ok(UpdateState::MergeFailed),
            other => Err(SnapshotError::corrupt(format!(
                "unknown update state token {other:?}"
            ))),
        }
    }
}

/// Per-snapshot lifecycle state, the first token of a status record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotState {
    #[default]
    None,
    Created,
    Merging,
    MergeCompleted,
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            SnapshotState::None => "none",
            SnapshotState::Created => "created",
            SnapshotState::Merging => "merging",
            SnapshotState::MergeCompleted => "merge-completed",
        };
        f.write_str(token)
    }
}

impl FromStr for SnapshotState {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(SnapshotState::None),
            "created" => Ok(SnapshotState::Created),
            "merging" => Ok(SnapshotState::Merging),
            "merge-completed" => Ok(SnapshotState::MergeCompleted),
            other => Err(SnapshotError::corrupt(format!(
                "unknown snapshot state token {other:?}"
            ))),
        }
    }
}

/// Persisted status of one snapshotted partition.
///
/// All byte sizes must be multiples of [`SECTOR_SIZE`]. `snapshot_size` is
/// the prefix of `device_size` that is shadowed by COW; if it is smaller
/// than `device_size` the partition is exposed as a snapshot device plus a
/// linear tail. The sector counters are the last observed kernel merge
/// progress and are zero until a merge starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStatus {
    pub state: SnapshotState,
    pub device_size: u64,
    pub snapshot_size: u64,
    pub cow_partition_size: u64,
    pub cow_file_size: u64,
    pub sectors_allocated: u64,
    pub metadata_sectors: u64,
}

impl SnapshotStatus {
    /// Encode as the 7-token status line.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.state,
            self.device_size,
            self.snapshot_size,
            self.cow_partition_size,
            self.cow_file_size,
            self.sectors_allocated,
            self.metadata_sectors
        )
    }

    /// Decode a status line. Splits on any whitespace; exactly 7 fields are
    /// required.
    pub fn decode(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 7 {
            return Err(SnapshotError::corrupt(format!(
                "snapshot status has {} fields, expected 7",
                tokens.len()
            )));
        }
        let field = |idx: usize, what: &str| -> Result<u64> {
            tokens[idx].parse::<u64>().map_err(|_| {
                SnapshotError::corrupt(format!("invalid {what} {:?} in status line", tokens[idx]))
            })
        };
        Ok(SnapshotStatus {
            state: tokens[0].parse()?,
            device_size: field(1, "device size")?,
            snapshot_size: field(2, "snapshot size")?,
            cow_partition_size: field(3, "cow partition size")?,
            cow_file_size: field(4, "cow file size")?,
            sectors_allocated: field(5, "allocated sector count")?,
            metadata_sectors: field(6, "metadata sector count")?,
        })
    }

    /// Validate the alignment invariants before the record is persisted.
    pub fn check_aligned(&self) -> Result<()> {
        for (what, value) in [
            ("device size", self.device_size),
            ("snapshot size", self.snapshot_size),
            ("cow partition size", self.cow_partition_size),
            ("cow file size", self.cow_file_size),
        ] {
            if value % SECTOR_SIZE != 0 {
                return Err(SnapshotError::SizeUnaligned { what, value });
            }
        }
        Ok(())
    }

    /// Whether any COW backing exists for this snapshot.
    pub fn has_cow(&self) -> bool {
        self.cow_partition_size + self.cow_file_size > 0
    }
}

/// Name of the composed COW device for a partition (`P-cow`).
pub fn cow_device_name(partition: &str) -> String {
    format!("{partition}-cow")
}

/// Name of the file-backed COW image device (`P-cow-img`).
pub fn cow_image_name(partition: &str) -> String {
    format!("{partition}-cow-img")
}

/// Name of the writable base linear device (`P-base`).
pub fn base_device_name(partition: &str) -> String {
    format!("{partition}-base")
}

/// Name of the inner snapshot device (`P-inner`), used when the outer
/// device also carries a linear tail.
pub fn inner_device_name(partition: &str) -> String {
    format!("{partition}-inner")
}

/// Name of the device holding the `snapshot`/`snapshot-merge` target.
///
/// This is the inner device when a linear tail exists, otherwise the outer
/// device itself.
pub fn snapshot_device_name(partition: &str, status: &SnapshotStatus) -> String {
    if status.snapshot_size != status.device_size {
        inner_device_name(partition)
    } else {
        partition.to_string()
    }
}
