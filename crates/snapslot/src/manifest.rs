//! Update manifest model.
//!
//! The payload producer describes the target slot's layout here: one entry
//! per updated partition (names carry no slot suffix), the partition's new
//! size, and the ordered install operations that together touch every byte
//! written into the target. Destination extents are expressed in
//! 4096-byte manifest blocks.

use serde::{Deserialize, Serialize};

/// Size of one manifest block, in bytes.
pub const BLOCK_SIZE: u64 = 4096;

/// A contiguous destination range, in manifest blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockExtent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl BlockExtent {
    pub fn num_bytes(&self) -> u64 {
        self.num_blocks * BLOCK_SIZE
    }
}

/// One install operation. Only the destination matters to the snapshot
/// engine; the payload bytes and the operation kind are the updater's
/// business.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOperation {
    #[serde(default)]
    pub dst_extents: Vec<BlockExtent>,
}

/// Update description for one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionUpdate {
    /// Partition name without slot suffix (e.g. `system`).
    pub partition_name: String,
    /// New size of the partition in the target slot, in bytes.
    pub new_size_bytes: u64,
    /// Ordered install operations describing every byte to be written.
    #[serde(default)]
    pub operations: Vec<InstallOperation>,
}

impl PartitionUpdate {
    /// Total bytes named by the destination extents, an upper bound on how
    /// much of the partition the update writes.
    pub fn bytes_written(&self) -> u64 {
        self.operations
            .iter()
            .flat_map(|op| op.dst_extents.iter())
            .map(BlockExtent::num_bytes)
            .sum()
    }
}

/// Dynamic partition group descriptor for the target slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupUpdate {
    /// Group name without slot suffix.
    pub name: String,
    /// Group budget in bytes; 0 means unlimited.
    pub size_bytes: u64,
    /// Partition names (unsuffixed) belonging to this group.
    #[serde(default)]
    pub partition_names: Vec<String>,
}

/// The full manifest consumed by `create_update_snapshots`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateManifest {
    #[serde(default)]
    pub partitions: Vec<PartitionUpdate>,
    #[serde(default)]
    pub groups: Vec<GroupUpdate>,
}
