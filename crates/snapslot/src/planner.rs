//! COW sizing.
//!
//! For each target partition the planner decides how much of the device
//! must be shadowed and how much COW backing that needs, preferring space
//! still free inside the super partition (which costs no user data) over a
//! file-backed image.

use crate::error::Result;
use crate::manifest::PartitionUpdate;
use crate::metadata::{Metadata, MetadataBuilder, PhysicalExtent};
use crate::state::{SECTOR_SIZE, SnapshotStatus};

/// The snapshot target's COW chunk size, in bytes (8 sectors).
pub const CHUNK_SIZE: u64 = 4096;

/// Exception-table entries per metadata chunk in the kernel's persistent
/// exception store (16 bytes per entry).
const EXCEPTIONS_PER_CHUNK: u64 = CHUNK_SIZE / 16;

/// Output of the planner for one partition.
#[derive(Debug, Clone)]
pub struct CowPlan {
    /// Sizes filled in; state and progress counters untouched.
    pub status: SnapshotStatus,
    /// Regions free in both slots' tables, eligible to host the in-super
    /// COW partition.
    pub usable_regions: Vec<PhysicalExtent>,
}

impl CowPlan {
    /// Whether this partition needs a snapshot at all.
    pub fn needs_snapshot(&self) -> bool {
        self.status.snapshot_size > 0
    }
}

/// Conservative upper bound on the COW store needed to shadow
/// `snapshot_size` bytes: every chunk rewritten once, plus one header chunk
/// and one metadata chunk per exception area.
pub fn cow_store_size(snapshot_size: u64) -> u64 {
    if snapshot_size == 0 {
        return 0;
    }
    let data_chunks = snapshot_size.div_ceil(CHUNK_SIZE);
    let metadata_chunks = data_chunks.div_ceil(EXCEPTIONS_PER_CHUNK);
    (1 + metadata_chunks + data_chunks) * CHUNK_SIZE
}

/// Compute the sizing plan for one target partition.
///
/// `operations` is the manifest's install-operation list for the
/// partition; `None` means the manifest carries no per-block information
/// and the whole device is shadowed.
pub fn plan_partition_cow(
    target_metadata: &MetadataBuilder,
    current_metadata: &Metadata,
    partition_name: &str,
    operations: Option<&PartitionUpdate>,
) -> Result<CowPlan> {
    let partition = target_metadata.find_partition(partition_name).ok_or_else(|| {
        crate::error::SnapshotError::metadata(format!(
            "planner asked about unknown partition {partition_name}"
        ))
    })?;
    let device_size = partition.size_bytes();

    // A partition that did not previously exist occupies only regions that
    // hold no live data, so nothing needs shadowing.
    let overlaps_current = partition.extents.iter().any(|extent| {
        current_metadata
            .partitions
            .iter()
            .flat_map(|p| p.extents.iter())
            .any(|used| used.overlaps(extent))
    });
    if !overlaps_current {
        tracing::info!(partition = %partition_name, "Partition occupies only new regions, no snapshot needed");
        return Ok(CowPlan {
            status: SnapshotStatus {
                device_size,
                ..Default::default()
            },
            usable_regions: Vec::new(),
        });
    }

    let written = match operations {
        Some(update) => update.bytes_written().min(device_size),
        None => device_size,
    };
    let snapshot_size = written.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    let cow_bytes = cow_store_size(snapshot_size);

    // Free space in the target table alone is not enough: the COW extents
    // must also not cover live current-slot data, or the merge would read
    // back garbage.
    let current_free = MetadataBuilder::from_metadata(current_metadata).free_regions();
    let usable_regions: Vec<PhysicalExtent> = target_metadata
        .free_regions()
        .iter()
        .flat_map(|t| current_free.iter().filter_map(|c| t.intersect(c)))
        .collect();

    let usable_bytes: u64 = usable_regions.iter().map(PhysicalExtent::num_bytes).sum();
    let cow_partition_size = cow_bytes.min(usable_bytes);
    let cow_file_size = cow_bytes - cow_partition_size;

    tracing::info!(
        partition = %partition_name,
        device_size,
        snapshot_size,
        cow_partition_size,
        cow_file_size,
        "Computed COW sizing"
    );

    Ok(CowPlan {
        status: SnapshotStatus {
            device_size,
            snapshot_size,
            cow_partition_size,
            cow_file_size,
            ..Default::default()
        },
        usable_regions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BlockExtent, InstallOperation};
    use crate::metadata::PARTITION_ATTR_UPDATED;

    fn current_with_system(super_sectors: u64, system_sectors: u64) -> Metadata {
        let mut builder = MetadataBuilder::new(super_sectors);
        builder.add_group("dynamic_a", 0).unwrap();
        builder
            .add_partition("system_a", "dynamic_a", PARTITION_ATTR_UPDATED)
            .unwrap();
        builder
            .resize_partition("system_a", system_sectors * SECTOR_SIZE, None)
            .unwrap();
        builder.export()
    }

    fn target_like(current: &Metadata, name: &str, size_sectors: u64) -> MetadataBuilder {
        // Seed the target table over the same space the current slot uses,
        // the way an update to the other slot does.
        let mut builder = MetadataBuilder::from_metadata(current);
        builder.add_group("dynamic_b", 0).unwrap();
        builder
            .add_partition(name, "dynamic_b", PARTITION_ATTR_UPDATED)
            .unwrap();
        // Overlap the current slot by reusing its first extents: emulate by
        // clearing current partitions from the builder first.
        builder.remove_partition("system_a");
        builder
            .resize_partition(name, size_sectors * SECTOR_SIZE, None)
            .unwrap();
        builder
    }

    fn update_writing_blocks(name: &str, blocks: u64) -> PartitionUpdate {
        PartitionUpdate {
            partition_name: name.to_string(),
            new_size_bytes: 0,
            operations: vec![InstallOperation {
                dst_extents: vec![BlockExtent {
                    start_block: 0,
                    num_blocks: blocks,
                }],
            }],
        }
    }

    #[test]
    fn cow_store_size_covers_data_and_metadata() {
        assert_eq!(cow_store_size(0), 0);
        // One chunk of data: header + 1 metadata chunk + 1 data chunk.
        assert_eq!(cow_store_size(4096), 3 * 4096);
        // 256 data chunks fill exactly one exception area.
        assert_eq!(cow_store_size(256 * 4096), (1 + 1 + 256) * 4096);
        // 257 spill into a second area.
        assert_eq!(cow_store_size(257 * 4096), (1 + 2 + 257) * 4096);
        // Sub-chunk sizes round up.
        assert_eq!(cow_store_size(512), 3 * 4096);
    }

    #[test]
    fn snapshot_size_follows_install_operations() {
        let current = current_with_system(65536, 16384);
        let target = target_like(&current, "system_b", 16384);
        let update = update_writing_blocks("system", 4);

        let plan =
            plan_partition_cow(&target, &current, "system_b", Some(&update)).unwrap();
        assert!(plan.needs_snapshot());
        assert_eq!(plan.status.device_size, 16384 * SECTOR_SIZE);
        assert_eq!(plan.status.snapshot_size, 4 * 4096);
        assert_eq!(
            plan.status.cow_partition_size + plan.status.cow_file_size,
            cow_store_size(4 * 4096)
        );
    }

    #[test]
    fn missing_operations_shadow_everything() {
        let current = current_with_system(65536, 16384);
        let target = target_like(&current, "system_b", 16384);
        let plan = plan_partition_cow(&target, &current, "system_b", None).unwrap();
        assert_eq!(plan.status.snapshot_size, plan.status.device_size);
    }

    #[test]
    fn in_super_cow_preferred_over_file() {
        let current = current_with_system(65536, 16384);
        let target = target_like(&current, "system_b", 16384);
        let update = update_writing_blocks("system", 4);
        let plan =
            plan_partition_cow(&target, &current, "system_b", Some(&update)).unwrap();
        // Plenty of space is free in both slots, so all COW is in-super.
        assert_eq!(plan.status.cow_file_size, 0);
        assert!(plan.status.cow_partition_size > 0);
        assert!(!plan.usable_regions.is_empty());
    }

    #[test]
    fn file_cow_absorbs_overflow_when_super_is_tight() {
        // Super barely larger than the partition: the target reuses the
        // current extents, leaving almost no free space in either slot.
        let current = current_with_system(16448, 16384);
        let target = target_like(&current, "system_b", 16384);
        let update = update_writing_blocks("system", 1024);
        let plan =
            plan_partition_cow(&target, &current, "system_b", Some(&update)).unwrap();
        let total = plan.status.cow_partition_size + plan.status.cow_file_size;
        assert_eq!(total, cow_store_size(1024 * 4096));
        assert!(plan.status.cow_file_size > 0);
        assert_eq!(plan.status.cow_partition_size, 64 * SECTOR_SIZE);
    }

    #[test]
    fn brand_new_partition_needs_no_cow() {
        let current = current_with_system(65536, 1024);
        // Target adds a partition placed after the current slot's extents.
        let mut target = MetadataBuilder::from_metadata(&current);
        target.add_group("dynamic_b", 0).unwrap();
        target
            .add_partition("product_b", "dynamic_b", PARTITION_ATTR_UPDATED)
            .unwrap();
        target
            .resize_partition("product_b", 512 * SECTOR_SIZE, None)
            .unwrap();

        let plan = plan_partition_cow(&target, &current, "product_b", None).unwrap();
        assert!(!plan.needs_snapshot());
        assert_eq!(plan.status.device_size, 512 * SECTOR_SIZE);
        assert_eq!(plan.status.cow_partition_size, 0);
        assert_eq!(plan.status.cow_file_size, 0);
    }
}
