//! Applies an update manifest to the target slot's partition table.
//!
//! Groups are brought to their manifest sizes before any partition inside
//! them is resized, so a shrinking group cannot transiently reject a
//! partition that still fits. Partitions absent from the manifest are
//! removed; new ones are created in their manifest group; every manifest
//! partition gets the `updated` attribute so external re-flashes can be
//! detected later.

use std::collections::HashSet;

use crate::error::{Result, SnapshotError};
use crate::manifest::UpdateManifest;
use crate::metadata::{MetadataBuilder, PARTITION_ATTR_UPDATED};

pub struct MetadataUpdater<'a> {
    manifest: &'a UpdateManifest,
    target_suffix: &'a str,
}

impl<'a> MetadataUpdater<'a> {
    pub fn new(manifest: &'a UpdateManifest, target_suffix: &'a str) -> Self {
        MetadataUpdater {
            manifest,
            target_suffix,
        }
    }

    pub fn update(&self, builder: &mut MetadataBuilder) -> Result<()> {
        self.verify_layout(builder)?;
        self.verify_manifest()?;
        self.update_groups(builder)?;
        self.remove_stale_partitions(builder);
        self.update_partitions(builder)?;
        Ok(())
    }

    /// Snapshots over retrofit layouts (where logical partitions span
    /// multiple physical block devices) are refused outright.
    fn verify_layout(&self, builder: &MetadataBuilder) -> Result<()> {
        match builder.block_device_names().first() {
            Some(first) if first == "super" => Ok(()),
            other => Err(SnapshotError::metadata(format!(
                "refusing retrofit layout; first block device is {other:?}"
            ))),
        }
    }

    fn verify_manifest(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for update in &self.manifest.partitions {
            if !seen.insert(update.partition_name.as_str()) {
                return Err(SnapshotError::metadata(format!(
                    "duplicated partition {} in update manifest",
                    update.partition_name
                )));
            }
        }
        Ok(())
    }

    fn update_groups(&self, builder: &mut MetadataBuilder) -> Result<()> {
        for group in &self.manifest.groups {
            let name = format!("{}{}", group.name, self.target_suffix);
            if builder.list_groups().contains(&name) {
                builder.resize_group(&name, group.size_bytes)?;
            } else {
                builder.add_group(&name, group.size_bytes)?;
            }
        }
        Ok(())
    }

    fn remove_stale_partitions(&self, builder: &mut MetadataBuilder) {
        let keep: HashSet<String> = self
            .manifest
            .partitions
            .iter()
            .map(|p| format!("{}{}", p.partition_name, self.target_suffix))
            .collect();
        let stale: Vec<String> = builder
            .partitions_with_suffix(self.target_suffix)
            .into_iter()
            .filter(|name| !keep.contains(name))
            .collect();
        for name in stale {
            tracing::info!(partition = %name, "Removing partition absent from manifest");
            builder.remove_partition(&name);
        }
    }

    fn update_partitions(&self, builder: &mut MetadataBuilder) -> Result<()> {
        for update in &self.manifest.partitions {
            let name = format!("{}{}", update.partition_name, self.target_suffix);
            let group = self.group_of(&update.partition_name)?;
            let group_name = format!("{group}{}", self.target_suffix);

            if builder.find_partition(&name).is_none() {
                if !builder.list_groups().contains(&group_name) {
                    return Err(SnapshotError::metadata(format!(
                        "partition {name} references group {group_name}, which does not exist"
                    )));
                }
                builder.add_partition(&name, &group_name, PARTITION_ATTR_UPDATED)?;
            } else {
                let attributes = builder
                    .find_partition(&name)
                    .map(|p| p.attributes | PARTITION_ATTR_UPDATED)
                    .unwrap_or(PARTITION_ATTR_UPDATED);
                builder.set_attributes(&name, attributes)?;
            }
            builder.resize_partition(&name, update.new_size_bytes, None)?;
        }
        Ok(())
    }

    fn group_of(&self, partition_name: &str) -> Result<&str> {
        self.manifest
            .groups
            .iter()
            .find(|g| g.partition_names.iter().any(|p| p == partition_name))
            .map(|g| g.name.as_str())
            .ok_or_else(|| {
                SnapshotError::metadata(format!(
                    "partition {partition_name} does not belong to any manifest group"
                ))
            })
    }
}
