//! Logical-partition metadata model.
//!
//! The super partition hosts logical partitions as lists of physical
//! extents, organized into groups with byte budgets. The engine consumes
//! this model through the [`MetadataStore`] trait; mutations for an update
//! go through [`MetadataBuilder`], which allocates extents first-fit from
//! free space and is exported back to a plain [`Metadata`] for writing.

use crate::error::{Result, SnapshotError};
use crate::state::SECTOR_SIZE;

/// Partition contents were written by the updater. A target-slot partition
/// without this attribute was re-flashed externally; its snapshot is stale.
pub const PARTITION_ATTR_UPDATED: u32 = 1 << 1;

/// Name of the group holding COW partitions. Partitions in this group are
/// never mapped during the normal partition lifecycle.
pub const COW_GROUP_NAME: &str = "cow";

/// A contiguous range of physical sectors in the super partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalExtent {
    pub start_sector: u64,
    pub num_sectors: u64,
}

impl PhysicalExtent {
    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.num_sectors
    }

    pub fn num_bytes(&self) -> u64 {
        self.num_sectors * SECTOR_SIZE
    }

    pub fn overlaps(&self, other: &PhysicalExtent) -> bool {
        self.start_sector < other.end_sector() && other.start_sector < self.end_sector()
    }

    /// The sub-range of `self` that also lies within `other`, if any.
    pub fn intersect(&self, other: &PhysicalExtent) -> Option<PhysicalExtent> {
        let start = self.start_sector.max(other.start_sector);
        let end = self.end_sector().min(other.end_sector());
        (start < end).then(|| PhysicalExtent {
            start_sector: start,
            num_sectors: end - start,
        })
    }
}

/// A partition group with a byte budget. Budget 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub maximum_size: u64,
}

/// One logical partition: suffixed name, owning group, attribute bits, and
/// the physical extents backing it, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub group: String,
    pub attributes: u32,
    pub extents: Vec<PhysicalExtent>,
}

impl PartitionInfo {
    pub fn size_bytes(&self) -> u64 {
        self.extents.iter().map(PhysicalExtent::num_bytes).sum()
    }

    pub fn is_updated(&self) -> bool {
        self.attributes & PARTITION_ATTR_UPDATED != 0
    }
}

/// Exported, read-only view of one slot's partition table.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Total size of the super partition, in sectors.
    pub super_sectors: u64,
    /// Names of the block devices backing the table. The first entry must
    /// be the super partition itself; anything else is a retrofit layout
    /// the engine refuses.
    pub block_device_names: Vec<String>,
    pub groups: Vec<Group>,
    pub partitions: Vec<PartitionInfo>,
}

impl Metadata {
    pub fn find_partition(&self, name: &str) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn group_of(&self, partition: &PartitionInfo) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == partition.group)
    }
}

/// Mutable partition table for building a target-slot update.
#[derive(Debug, Clone)]
pub struct MetadataBuilder {
    super_sectors: u64,
    block_device_names: Vec<String>,
    groups: Vec<Group>,
    partitions: Vec<PartitionInfo>,
}

impl MetadataBuilder {
    /// A fresh table over a super partition of `super_sectors` sectors,
    /// with only the unlimited `default` group.
    pub fn new(super_sectors: u64) -> Self {
        MetadataBuilder {
            super_sectors,
            block_device_names: vec!["super".to_string()],
            groups: vec![Group {
                name: "default".to_string(),
                maximum_size: 0,
            }],
            partitions: Vec::new(),
        }
    }

    /// Import an exported table for further mutation.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        MetadataBuilder {
            super_sectors: metadata.super_sectors,
            block_device_names: metadata.block_device_names.clone(),
            groups: metadata.groups.clone(),
            partitions: metadata.partitions.clone(),
        }
    }

    pub fn super_sectors(&self) -> u64 {
        self.super_sectors
    }

    pub fn block_device_names(&self) -> &[String] {
        &self.block_device_names
    }

    pub fn add_group(&mut self, name: &str, maximum_size: u64) -> Result<()> {
        if self.groups.iter().any(|g| g.name == name) {
            return Err(SnapshotError::metadata(format!(
                "group {name} already exists"
            )));
        }
        self.groups.push(Group {
            name: name.to_string(),
            maximum_size,
        });
        Ok(())
    }

    pub fn resize_group(&mut self, name: &str, maximum_size: u64) -> Result<()> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| SnapshotError::metadata(format!("no such group {name}")))?;
        group.maximum_size = maximum_size;
        Ok(())
    }

    pub fn list_groups(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    /// Add an empty partition to `group`.
    pub fn add_partition(&mut self, name: &str, group: &str, attributes: u32) -> Result<()> {
        if self.partitions.iter().any(|p| p.name == name) {
            return Err(SnapshotError::metadata(format!(
                "partition {name} already exists"
            )));
        }
        if !self.groups.iter().any(|g| g.name == group) {
            return Err(SnapshotError::metadata(format!(
                "partition {name} references unknown group {group}"
            )));
        }
        self.partitions.push(PartitionInfo {
            name: name.to_string(),
            group: group.to_string(),
            attributes,
            extents: Vec::new(),
        });
        Ok(())
    }

    pub fn remove_partition(&mut self, name: &str) {
        self.partitions.retain(|p| p.name != name);
    }

    pub fn find_partition(&self, name: &str) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn set_attributes(&mut self, name: &str, attributes: u32) -> Result<()> {
        let partition = self
            .partitions
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| SnapshotError::metadata(format!("no such partition {name}")))?;
        partition.attributes = attributes;
        Ok(())
    }

    pub fn list_partitions(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.partitions.iter()
    }

    pub fn partitions_in_group(&self, group: &str) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|p| p.group == group)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Names of partitions whose name ends in `suffix`, in table order.
    pub fn partitions_with_suffix(&self, suffix: &str) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|p| p.name.ends_with(suffix))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Regions of the super partition not covered by any partition's
    /// extents, in ascending order.
    pub fn free_regions(&self) -> Vec<PhysicalExtent> {
        let mut used: Vec<PhysicalExtent> = self
            .partitions
            .iter()
            .flat_map(|p| p.extents.iter().copied())
            .collect();
        used.sort_by_key(|e| e.start_sector);

        let mut free = Vec::new();
        let mut cursor = 0u64;
        for extent in used {
            if extent.start_sector > cursor {
                free.push(PhysicalExtent {
                    start_sector: cursor,
                    num_sectors: extent.start_sector - cursor,
                });
            }
            cursor = cursor.max(extent.end_sector());
        }
        if cursor < self.super_sectors {
            free.push(PhysicalExtent {
                start_sector: cursor,
                num_sectors: self.super_sectors - cursor,
            });
        }
        free
    }

    /// Grow or shrink `name` to `size_bytes`. Growth allocates first-fit
    /// from free regions, optionally restricted to `usable_regions`.
    /// Fails with `MetadataInvalid` when the group budget or the super
    /// partition cannot accommodate the new size.
    pub fn resize_partition(
        &mut self,
        name: &str,
        size_bytes: u64,
        usable_regions: Option<&[PhysicalExtent]>,
    ) -> Result<()> {
        if size_bytes % SECTOR_SIZE != 0 {
            return Err(SnapshotError::SizeUnaligned {
                what: "partition size",
                value: size_bytes,
            });
        }
        let target_sectors = size_bytes / SECTOR_SIZE;

        let idx = self
            .partitions
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| SnapshotError::metadata(format!("no such partition {name}")))?;

        // Enforce the group budget against the other members' current sizes.
        let group_name = self.partitions[idx].group.clone();
        let group = self
            .groups
            .iter()
            .find(|g| g.name == group_name)
            .ok_or_else(|| SnapshotError::metadata(format!("no such group {group_name}")))?;
        if group.maximum_size > 0 {
            let others: u64 = self
                .partitions
                .iter()
                .filter(|p| p.group == group_name && p.name != name)
                .map(PartitionInfo::size_bytes)
                .sum();
            if others + size_bytes > group.maximum_size {
                return Err(SnapshotError::metadata(format!(
                    "resizing {name} to {size_bytes} exceeds group {group_name} budget {}",
                    group.maximum_size
                )));
            }
        }

        let current_sectors: u64 = self.partitions[idx]
            .extents
            .iter()
            .map(|e| e.num_sectors)
            .sum();

        if target_sectors < current_sectors {
            self.truncate_extents(idx, target_sectors);
            return Ok(());
        }
        if target_sectors == current_sectors {
            return Ok(());
        }

        let mut needed = target_sectors - current_sectors;
        let free = self.free_regions();
        let candidates: Vec<PhysicalExtent> = match usable_regions {
            Some(regions) => free
                .iter()
                .flat_map(|f| regions.iter().filter_map(|r| f.intersect(r)))
                .collect(),
            None => free,
        };

        let mut grabbed = Vec::new();
        for region in candidates {
            if needed == 0 {
                break;
            }
            let take = region.num_sectors.min(needed);
            grabbed.push(PhysicalExtent {
                start_sector: region.start_sector,
                num_sectors: take,
            });
            needed -= take;
        }
        if needed > 0 {
            return Err(SnapshotError::metadata(format!(
                "not enough free space to grow {name} to {size_bytes} bytes \
                 ({needed} sectors short)"
            )));
        }
        self.partitions[idx].extents.extend(grabbed);
        Ok(())
    }

    fn truncate_extents(&mut self, idx: usize, target_sectors: u64) {
        let mut kept = Vec::new();
        let mut remaining = target_sectors;
        for extent in &self.partitions[idx].extents {
            if remaining == 0 {
                break;
            }
            let take = extent.num_sectors.min(remaining);
            kept.push(PhysicalExtent {
                start_sector: extent.start_sector,
                num_sectors: take,
            });
            remaining -= take;
        }
        self.partitions[idx].extents = kept;
    }

    pub fn export(&self) -> Metadata {
        Metadata {
            super_sectors: self.super_sectors,
            block_device_names: self.block_device_names.clone(),
            groups: self.groups.clone(),
            partitions: self.partitions.clone(),
        }
    }
}

/// Access to the persisted partition tables of the super partition.
pub trait MetadataStore: Send + Sync {
    /// Read the exported table for `slot`.
    fn read_metadata(&self, super_device: &str, slot: u32) -> Result<Metadata>;

    /// Start a target-slot table seeded from the current slot's contents,
    /// with slot suffixes flipped to the target slot.
    fn new_metadata_for_update(
        &self,
        super_device: &str,
        current_slot: u32,
        target_slot: u32,
    ) -> Result<MetadataBuilder>;

    /// Persist `metadata` as the table for `slot`.
    fn update_partition_table(
        &self,
        super_device: &str,
        metadata: &Metadata,
        slot: u32,
    ) -> Result<()>;
}
