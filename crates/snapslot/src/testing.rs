//! Fake collaborators for engine tests.
//!
//! The fakes model just enough of the kernel and platform surface for the
//! state machine to run end to end: an in-memory device table whose
//! snapshot targets carry controllable merge counters, a file-less image
//! store, and a per-slot metadata store. Device nodes are real temp files
//! so COW initialization can actually write.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::engine::SnapshotManager;
use crate::error::{Result, SnapshotError};
use crate::hooks::DeviceHooks;
use crate::images::ImageManager;
use crate::manifest::{BlockExtent, GroupUpdate, InstallOperation, PartitionUpdate, UpdateManifest};
use crate::mapper::{BlockMapper, DmTarget, SnapshotMode, TargetEntry, TargetStatus};
use crate::metadata::{
    Metadata, MetadataBuilder, MetadataStore, PARTITION_ATTR_UPDATED,
};
use crate::state::SECTOR_SIZE;

pub const TEST_SUPER: &str = "super";

fn suffix_for_slot(slot: u32) -> &'static str {
    if slot == 0 { "_a" } else { "_b" }
}

#[derive(Debug, Clone)]
struct FakeDevice {
    table: Vec<DmTarget>,
    node: PathBuf,
    /// (allocated, total, metadata) counters reported for snapshot
    /// targets.
    counters: (u64, u64, u64),
    device_string: String,
}

/// In-memory block mapper.
pub struct FakeMapper {
    node_dir: PathBuf,
    devices: Mutex<HashMap<String, FakeDevice>>,
    next_minor: Mutex<u32>,
    /// Device names whose creation is forced to time out.
    fail_create: Mutex<HashSet<String>>,
}

impl FakeMapper {
    pub fn new(node_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&node_dir).unwrap();
        FakeMapper {
            node_dir,
            devices: Mutex::new(HashMap::new()),
            next_minor: Mutex::new(0),
            fail_create: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_next_create(&self, name: &str) {
        self.fail_create.lock().unwrap().insert(name.to_string());
    }

    /// Simulate a reboot: every device vanishes.
    pub fn clear(&self) {
        let mut devices = self.devices.lock().unwrap();
        for device in devices.values() {
            let _ = std::fs::remove_file(&device.node);
        }
        devices.clear();
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Force a device's snapshot counters.
    pub fn set_counters(&self, name: &str, allocated: u64, total: u64, metadata: u64) {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(name).expect("no such fake device");
        device.counters = (allocated, total, metadata);
    }

    /// Finish every merge target: allocated counters climb to the
    /// metadata count, which is the kernel's completion condition.
    pub fn complete_merges(&self) {
        let mut devices = self.devices.lock().unwrap();
        for device in devices.values_mut() {
            let is_merge = device.table.iter().any(|t| {
                matches!(
                    t,
                    DmTarget::Snapshot {
                        mode: SnapshotMode::Merge,
                        ..
                    }
                )
            });
            if is_merge {
                device.counters.0 = device.counters.2;
            }
        }
    }

    fn has_snapshot_target(table: &[DmTarget]) -> bool {
        table.iter().any(|t| matches!(t, DmTarget::Snapshot { .. }))
    }
}

impl BlockMapper for FakeMapper {
    fn create(&self, name: &str, table: &[DmTarget], _timeout: Duration) -> Result<PathBuf> {
        if self.fail_create.lock().unwrap().remove(name) {
            return Err(SnapshotError::Timeout {
                name: name.to_string(),
            });
        }
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(name) {
            return Err(SnapshotError::mapper(
                name,
                "create",
                anyhow::anyhow!("device already exists"),
            ));
        }
        let node = self.node_dir.join(name);
        std::fs::write(&node, vec![0u8; 4096]).unwrap();
        let minor = {
            let mut next = self.next_minor.lock().unwrap();
            *next += 1;
            *next
        };
        let counters = if Self::has_snapshot_target(table) {
            // A busy store: allocated still well below the metadata count,
            // so a fresh merge target reads as in-progress.
            (16, 4096, 800)
        } else {
            (0, 0, 0)
        };
        devices.insert(
            name.to_string(),
            FakeDevice {
                table: table.to_vec(),
                node: node.clone(),
                counters,
                device_string: format!("253:{minor}"),
            },
        );
        Ok(node)
    }

    fn load_table_and_activate(&self, name: &str, table: &[DmTarget]) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(name).ok_or_else(|| {
            SnapshotError::mapper(name, "load-table", anyhow::anyhow!("no such device"))
        })?;
        device.table = table.to_vec();
        Ok(())
    }

    fn delete_if_exists(&self, name: &str) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.remove(name) {
            let _ = std::fs::remove_file(&device.node);
        }
        Ok(())
    }

    fn device_exists(&self, name: &str) -> bool {
        self.devices.lock().unwrap().contains_key(name)
    }

    fn get_table(&self, name: &str) -> Result<Vec<TargetEntry>> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(name)
            .ok_or_else(|| SnapshotError::mapper(name, "table", anyhow::anyhow!("no such device")))?;
        Ok(device
            .table
            .iter()
            .map(|target| match target {
                DmTarget::Linear {
                    start_sector,
                    num_sectors,
                    backing,
                    backing_sector,
                } => TargetEntry {
                    kind: "linear".to_string(),
                    start_sector: *start_sector,
                    num_sectors: *num_sectors,
                    params: format!("{backing} {backing_sector}"),
                },
                DmTarget::Snapshot {
                    num_sectors,
                    base,
                    cow,
                    mode,
                    chunk_sectors,
                } => TargetEntry {
                    kind: match mode {
                        SnapshotMode::Persistent => "snapshot".to_string(),
                        SnapshotMode::Merge => "snapshot-merge".to_string(),
                    },
                    start_sector: 0,
                    num_sectors: *num_sectors,
                    params: format!("{base} {cow} P {chunk_sectors}"),
                },
            })
            .collect())
    }

    fn get_status(&self, name: &str) -> Result<Vec<TargetStatus>> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(name).ok_or_else(|| {
            SnapshotError::mapper(name, "status", anyhow::anyhow!("no such device"))
        })?;
        let (allocated, total, metadata) = device.counters;
        Ok(device
            .table
            .iter()
            .map(|target| match target {
                DmTarget::Linear { .. } => TargetStatus {
                    kind: "linear".to_string(),
                    status: String::new(),
                },
                DmTarget::Snapshot { mode, .. } => TargetStatus {
                    kind: match mode {
                        SnapshotMode::Persistent => "snapshot".to_string(),
                        SnapshotMode::Merge => "snapshot-merge".to_string(),
                    },
                    status: format!("{allocated}/{total} {metadata}"),
                },
            })
            .collect())
    }

    fn get_device_string(&self, name: &str) -> Result<String> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(name)
            .ok_or_else(|| SnapshotError::mapper(name, "stat", anyhow::anyhow!("no such device")))?;
        Ok(device.device_string.clone())
    }

    fn get_device_path(&self, name: &str) -> Result<PathBuf> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(name)
            .ok_or_else(|| SnapshotError::mapper(name, "path", anyhow::anyhow!("no such device")))?;
        Ok(device.node.clone())
    }
}

/// In-memory image store. Mapping registers a linear device with the
/// mapper, so images look exactly like any other mapped device.
pub struct FakeImages {
    mapper: Arc<FakeMapper>,
    images: Mutex<HashMap<String, u64>>,
}

impl FakeImages {
    pub fn new(mapper: Arc<FakeMapper>) -> Self {
        FakeImages {
            mapper,
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn image_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn map_impl(&self, mapper: &dyn BlockMapper, name: &str) -> Result<PathBuf> {
        let size = *self.images.lock().unwrap().get(name).ok_or_else(|| {
            SnapshotError::image(name, "map", anyhow::anyhow!("no such backing image"))
        })?;
        let table = [DmTarget::Linear {
            start_sector: 0,
            num_sectors: size / SECTOR_SIZE,
            backing: "7:0".to_string(),
            backing_sector: 0,
        }];
        mapper.create(name, &table, Duration::ZERO)
    }
}

impl ImageManager for FakeImages {
    fn create_backing_image(&self, name: &str, size_bytes: u64) -> Result<()> {
        if size_bytes % SECTOR_SIZE != 0 {
            return Err(SnapshotError::SizeUnaligned {
                what: "image size",
                value: size_bytes,
            });
        }
        let mut images = self.images.lock().unwrap();
        if images.contains_key(name) {
            return Err(SnapshotError::image(
                name,
                "create",
                anyhow::anyhow!("image already exists"),
            ));
        }
        images.insert(name.to_string(), size_bytes);
        Ok(())
    }

    fn backing_image_exists(&self, name: &str) -> bool {
        self.images.lock().unwrap().contains_key(name)
    }

    fn delete_backing_image(&self, name: &str) -> Result<()> {
        if self.mapper.device_exists(name) {
            return Err(SnapshotError::image(
                name,
                "delete",
                anyhow::anyhow!("image is still mapped"),
            ));
        }
        self.images.lock().unwrap().remove(name);
        Ok(())
    }

    fn map_image(&self, name: &str, _timeout: Duration) -> Result<PathBuf> {
        self.map_impl(self.mapper.as_ref(), name)
    }

    fn map_image_with_mapper(&self, mapper: &dyn BlockMapper, name: &str) -> Result<PathBuf> {
        self.map_impl(mapper, name)
    }

    fn unmap_image_if_exists(&self, name: &str) -> Result<()> {
        self.mapper.delete_if_exists(name)
    }
}

/// Per-(super, slot) metadata tables.
pub struct FakeMetadataStore {
    tables: Mutex<HashMap<(String, u32), Metadata>>,
}

impl FakeMetadataStore {
    pub fn new() -> Self {
        FakeMetadataStore {
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_metadata(&self, super_device: &str, slot: u32, metadata: Metadata) {
        self.tables
            .lock()
            .unwrap()
            .insert((super_device.to_string(), slot), metadata);
    }

    pub fn clear_updated_attr(&self, super_device: &str, slot: u32, partition: &str) {
        let mut tables = self.tables.lock().unwrap();
        let metadata = tables
            .get_mut(&(super_device.to_string(), slot))
            .expect("no metadata for slot");
        let partition = metadata
            .partitions
            .iter_mut()
            .find(|p| p.name == partition)
            .expect("no such partition");
        partition.attributes &= !PARTITION_ATTR_UPDATED;
    }
}

impl MetadataStore for FakeMetadataStore {
    fn read_metadata(&self, super_device: &str, slot: u32) -> Result<Metadata> {
        self.tables
            .lock()
            .unwrap()
            .get(&(super_device.to_string(), slot))
            .cloned()
            .ok_or_else(|| {
                SnapshotError::metadata(format!("no metadata for {super_device} slot {slot}"))
            })
    }

    fn new_metadata_for_update(
        &self,
        super_device: &str,
        current_slot: u32,
        target_slot: u32,
    ) -> Result<MetadataBuilder> {
        let current = self.read_metadata(super_device, current_slot)?;
        let from = suffix_for_slot(current_slot);
        let to = suffix_for_slot(target_slot);

        // Seed the target table from the current one with suffixes
        // flipped, the way an A/B update builds the other slot in place.
        let mut seeded = current.clone();
        for group in &mut seeded.groups {
            if let Some(base) = group.name.strip_suffix(from) {
                group.name = format!("{base}{to}");
            }
        }
        for partition in &mut seeded.partitions {
            if let Some(base) = partition.name.strip_suffix(from) {
                partition.name = format!("{base}{to}");
            }
            if let Some(base) = partition.group.strip_suffix(from) {
                partition.group = format!("{base}{to}");
            }
        }
        Ok(MetadataBuilder::from_metadata(&seeded))
    }

    fn update_partition_table(
        &self,
        super_device: &str,
        metadata: &Metadata,
        slot: u32,
    ) -> Result<()> {
        self.set_metadata(super_device, slot, metadata.clone());
        Ok(())
    }
}

/// A full engine wired to fakes over a temp metadata directory.
pub struct Fixture {
    pub tempdir: tempfile::TempDir,
    pub mapper: Arc<FakeMapper>,
    pub images: Arc<FakeImages>,
    pub metadata: Arc<FakeMetadataStore>,
    pub manager: SnapshotManager,
    slot: Arc<Mutex<String>>,
    overlayfs: Arc<AtomicBool>,
}

impl Fixture {
    pub fn new() -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let mapper = Arc::new(FakeMapper::new(tempdir.path().join("dev")));
        let images = Arc::new(FakeImages::new(mapper.clone()));
        let metadata = Arc::new(FakeMetadataStore::new());
        let slot = Arc::new(Mutex::new("_a".to_string()));
        let overlayfs = Arc::new(AtomicBool::new(false));

        let hooks = {
            let slot = slot.clone();
            let other = slot.clone();
            let overlayfs = overlayfs.clone();
            DeviceHooks {
                slot_suffix: Box::new(move || slot.lock().unwrap().clone()),
                other_slot_suffix: Box::new(move || {
                    if other.lock().unwrap().as_str() == "_a" {
                        "_b".to_string()
                    } else {
                        "_a".to_string()
                    }
                }),
                super_device: Box::new(|_slot| TEST_SUPER.to_string()),
                is_overlayfs_setup: Box::new(move || overlayfs.load(Ordering::SeqCst)),
            }
        };

        let config = EngineConfig {
            metadata_dir: tempdir.path().join("meta"),
            images_dir: tempdir.path().join("images"),
            mapping_timeout: Duration::ZERO,
        };
        let manager = SnapshotManager::new(
            config,
            hooks,
            mapper.clone(),
            images.clone(),
            metadata.clone(),
        );
        Fixture {
            tempdir,
            mapper,
            images,
            metadata,
            manager,
            slot,
            overlayfs,
        }
    }

    /// Seed slot 0 (`_a`) with one updated `system_a` partition of
    /// `system_sectors` sectors inside a super of `super_sectors`.
    pub fn seed_current_slot(&self, super_sectors: u64, system_sectors: u64) {
        let mut builder = MetadataBuilder::new(super_sectors);
        builder.add_group("dynamic_a", 0).unwrap();
        builder
            .add_partition("system_a", "dynamic_a", PARTITION_ATTR_UPDATED)
            .unwrap();
        builder
            .resize_partition("system_a", system_sectors * SECTOR_SIZE, None)
            .unwrap();
        self.metadata.set_metadata(TEST_SUPER, 0, builder.export());
    }

    /// A manifest updating `system` in place, writing `write_blocks`
    /// 4096-byte blocks.
    pub fn system_manifest(&self, new_size_bytes: u64, write_blocks: u64) -> UpdateManifest {
        UpdateManifest {
            partitions: vec![PartitionUpdate {
                partition_name: "system".to_string(),
                new_size_bytes,
                operations: vec![InstallOperation {
                    dst_extents: vec![BlockExtent {
                        start_block: 0,
                        num_blocks: write_blocks,
                    }],
                }],
            }],
            groups: vec![GroupUpdate {
                name: "dynamic".to_string(),
                size_bytes: 0,
                partition_names: vec!["system".to_string()],
            }],
        }
    }

    /// Simulate a reboot into `suffix`: all mapped devices vanish and the
    /// bootloader selects the slot.
    pub fn reboot_into(&self, suffix: &str) {
        self.mapper.clear();
        *self.slot.lock().unwrap() = suffix.to_string();
    }

    pub fn set_overlayfs(&self, value: bool) {
        self.overlayfs.store(value, Ordering::SeqCst);
    }
}
