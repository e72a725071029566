use std::fs;

use crate::error::SnapshotError;
use crate::images::ImageManager;
use crate::mapper::BlockMapper;
use crate::metadata::{COW_GROUP_NAME, MetadataBuilder, MetadataStore, PARTITION_ATTR_UPDATED};
use crate::planner::cow_store_size;
use crate::state::{SECTOR_SIZE, SnapshotState, SnapshotStatus, UpdateState};
use crate::testing::{Fixture, TEST_SUPER};

const MIB: u64 = 1024 * 1024;

/// 128 MiB super with an 8 MiB system partition in the current slot.
fn staged_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture.seed_current_slot(262144, 16384);
    fixture
}

fn state_file_contents(fixture: &Fixture) -> String {
    fs::read_to_string(fixture.manager.store().state_file_path()).unwrap()
}

fn snapshot_status(fixture: &Fixture, name: &str) -> SnapshotStatus {
    let lock = fixture.manager.lock_shared().unwrap();
    fixture
        .manager
        .store()
        .read_snapshot_status(&lock, name)
        .unwrap()
}

fn snapshot_names(fixture: &Fixture) -> Vec<String> {
    let lock = fixture.manager.lock_shared().unwrap();
    fixture.manager.store().list_snapshots(&lock).unwrap()
}

#[test]
fn clean_update_and_merge() {
    let fixture = staged_fixture();

    fixture.manager.begin_update().unwrap();
    assert_eq!(state_file_contents(&fixture), "initiated");

    // Update system in place, writing 4 MiB of its 8 MiB.
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();

    let status = snapshot_status(&fixture, "system_b");
    assert_eq!(status.state, SnapshotState::Created);
    assert_eq!(status.device_size, 8 * MIB);
    assert_eq!(status.snapshot_size, 4 * MIB);
    // The super has plenty of space free in both slots, so the COW lives
    // entirely in-super.
    assert_eq!(status.cow_partition_size, cow_store_size(4 * MIB));
    assert_eq!(status.cow_file_size, 0);

    // The target table gained the COW partition, in the cow group.
    let target = fixture.metadata.read_metadata(TEST_SUPER, 1).unwrap();
    let cow = target.find_partition("system_b-cow").unwrap();
    assert_eq!(cow.group, COW_GROUP_NAME);
    assert_eq!(cow.size_bytes(), status.cow_partition_size);

    // Nothing stays mapped after snapshot creation.
    assert!(fixture.mapper.device_names().is_empty());

    let path = fixture.manager.map_update_snapshot("system_b").unwrap();
    assert!(path.exists());
    assert_eq!(
        fixture.mapper.device_names(),
        vec![
            "system_b".to_string(),
            "system_b-base".to_string(),
            "system_b-cow".to_string(),
            "system_b-inner".to_string(),
        ]
    );

    // The outer device spans the full partition; the first range is the
    // snapshotted prefix.
    let outer = fixture.mapper.get_table("system_b").unwrap();
    assert_eq!(outer.len(), 2);
    let total: u64 = outer.iter().map(|t| t.num_sectors).sum();
    assert_eq!(total * SECTOR_SIZE, status.device_size);
    assert_eq!(outer[0].num_sectors * SECTOR_SIZE, status.snapshot_size);
    let inner = fixture.mapper.get_table("system_b-inner").unwrap();
    assert_eq!(inner.len(), 1);
    assert_eq!(inner[0].kind, "snapshot");

    fixture.manager.finished_snapshot_writes().unwrap();
    assert_eq!(state_file_contents(&fixture), "unverified");
    assert_eq!(
        fixture.manager.store().read_boot_indicator().as_deref(),
        Some("_a")
    );
    // Idempotent from Unverified.
    fixture.manager.finished_snapshot_writes().unwrap();

    fixture.reboot_into("_b");
    assert!(fixture.manager.need_snapshots_in_first_stage_mount());
    fixture
        .manager
        .create_logical_and_snapshot_partitions(TEST_SUPER)
        .unwrap();
    assert_eq!(
        fixture.mapper.device_names(),
        vec![
            "system_b".to_string(),
            "system_b-base".to_string(),
            "system_b-cow".to_string(),
            "system_b-inner".to_string(),
        ]
    );

    // Half the store already worked through when the merge is recorded.
    fixture.mapper.set_counters("system_b-inner", 400, 4096, 800);
    fixture.manager.initiate_merge().unwrap();
    assert_eq!(state_file_contents(&fixture), "merging");
    let inner = fixture.mapper.get_table("system_b-inner").unwrap();
    assert_eq!(inner[0].kind, "snapshot-merge");
    let status = snapshot_status(&fixture, "system_b");
    assert_eq!(status.state, SnapshotState::Merging);
    assert!(status.sectors_allocated < status.metadata_sectors);

    let mut progress = -1.0;
    assert_eq!(
        fixture.manager.get_update_state(Some(&mut progress)).unwrap(),
        UpdateState::Merging
    );
    assert_eq!(progress, 50.0);

    fixture.mapper.complete_merges();
    let state = fixture.manager.process_update_state().unwrap();
    assert_eq!(state, UpdateState::MergeCompleted);

    // Everything is cleaned up and acknowledged.
    assert_eq!(state_file_contents(&fixture), "none");
    assert!(snapshot_names(&fixture).is_empty());
    assert_eq!(fixture.manager.store().read_boot_indicator(), None);

    // Collapse safety: the outer device is a plain linear stack and no
    // helper devices survive.
    let outer = fixture.mapper.get_table("system_b").unwrap();
    assert!(outer.iter().all(|t| t.kind == "linear"));
    for helper in ["system_b-base", "system_b-inner", "system_b-cow", "system_b-cow-img"] {
        assert!(!fixture.mapper.device_exists(helper), "{helper} survived collapse");
    }

    let mut progress = -1.0;
    assert_eq!(
        fixture.manager.get_update_state(Some(&mut progress)).unwrap(),
        UpdateState::None
    );
    assert_eq!(progress, 0.0);
}

#[test]
fn cancel_before_reboot_discards_everything() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();
    assert_eq!(snapshot_names(&fixture), vec!["system_b"]);

    fixture.manager.cancel_update().unwrap();
    assert_eq!(state_file_contents(&fixture), "none");
    assert!(snapshot_names(&fixture).is_empty());
    assert!(fixture.images.image_names().is_empty());
    assert!(fixture.mapper.device_names().is_empty());
}

#[test]
fn cancel_after_reboot_before_merge() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    fixture.manager.finished_snapshot_writes().unwrap();

    fixture.reboot_into("_b");
    // The boot indicator (_a) differs from the current slot (_b); the
    // rollback path stays open until a merge starts.
    fixture.manager.cancel_update().unwrap();
    assert_eq!(state_file_contents(&fixture), "none");
    assert_eq!(fixture.manager.store().read_boot_indicator(), None);
}

#[test]
fn rollback_into_old_slot_cancels_update() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();
    fixture.manager.finished_snapshot_writes().unwrap();

    // The device rebooted, but the bootloader picked the old slot again.
    fixture.reboot_into("_a");
    let state = fixture.manager.process_update_state().unwrap();
    assert_eq!(state, UpdateState::Cancelled);
    assert_eq!(state_file_contents(&fixture), "none");
    assert!(snapshot_names(&fixture).is_empty());
}

#[test]
fn unaligned_device_size_writes_nothing() {
    let fixture = staged_fixture();
    let lock = fixture.manager.lock_exclusive().unwrap();
    let status = SnapshotStatus {
        device_size: 8193,
        snapshot_size: 4096,
        cow_file_size: 4096,
        ..Default::default()
    };
    let err = fixture
        .manager
        .create_snapshot(&lock, "system_b", status)
        .unwrap_err();
    assert!(matches!(err, SnapshotError::SizeUnaligned { .. }));
    assert!(!fixture.manager.store().snapshot_status_exists("system_b"));
}

#[test]
fn status_line_matches_on_disk_format() {
    let fixture = staged_fixture();
    let lock = fixture.manager.lock_exclusive().unwrap();
    fixture
        .manager
        .create_snapshot(
            &lock,
            "vendor_b",
            SnapshotStatus {
                device_size: 8192,
                snapshot_size: 4096,
                cow_file_size: 4096,
                ..Default::default()
            },
        )
        .unwrap();
    drop(lock);
    let contents = fs::read_to_string(
        fixture
            .tempdir
            .path()
            .join("meta")
            .join("snapshots")
            .join("vendor_b"),
    )
    .unwrap();
    assert_eq!(contents, "created 8192 4096 0 4096 0 0");
}

#[test]
fn partial_mapping_failure_rolls_back_devices() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();

    // Target slot table with an updated system_b over live extents.
    let mut builder = MetadataBuilder::new(262144);
    builder.add_group("dynamic_b", 0).unwrap();
    builder
        .add_partition("system_b", "dynamic_b", PARTITION_ATTR_UPDATED)
        .unwrap();
    builder
        .resize_partition("system_b", 8 * MIB, None)
        .unwrap();
    fixture.metadata.set_metadata(TEST_SUPER, 1, builder.export());

    // Snapshot record with file-backed COW only.
    let cow_file_size = cow_store_size(4 * MIB);
    let lock = fixture.manager.lock_exclusive().unwrap();
    fixture
        .manager
        .create_snapshot(
            &lock,
            "system_b",
            SnapshotStatus {
                device_size: 8 * MIB,
                snapshot_size: 4 * MIB,
                cow_file_size,
                ..Default::default()
            },
        )
        .unwrap();
    drop(lock);
    fixture
        .images
        .create_backing_image("system_b-cow-img", cow_file_size)
        .unwrap();

    // The COW image maps, then the snapshot target creation times out.
    fixture.mapper.fail_next_create("system_b-inner");
    let err = fixture.manager.map_update_snapshot("system_b").unwrap_err();
    assert!(matches!(err, SnapshotError::Timeout { .. }));

    // Everything mapped along the way was torn back down; the record and
    // the backing image are untouched.
    assert!(fixture.mapper.device_names().is_empty());
    assert!(fixture.manager.store().snapshot_status_exists("system_b"));
    assert!(fixture.images.backing_image_exists("system_b-cow-img"));
}

#[test]
fn create_update_snapshots_rolls_back_on_failure() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();

    // Fail the COW-device mapping used for zero-initialization.
    fixture.mapper.fail_next_create("system_b-cow");
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    assert!(fixture.manager.create_update_snapshots(&manifest).is_err());

    // The status record was rolled back with everything else.
    assert!(snapshot_names(&fixture).is_empty());
    assert!(fixture.images.image_names().is_empty());
    assert!(fixture.mapper.device_names().is_empty());
    assert_eq!(state_file_contents(&fixture), "initiated");
}

#[test]
fn begin_update_refused_while_merging() {
    let fixture = staged_fixture();
    {
        let lock = fixture.manager.lock_exclusive().unwrap();
        fixture
            .manager
            .store()
            .write_update_state(&lock, UpdateState::Merging)
            .unwrap();
    }
    assert!(matches!(
        fixture.manager.begin_update().unwrap_err(),
        SnapshotError::InvalidTransition { op: "begin_update", .. }
    ));
    assert!(matches!(
        fixture.manager.cancel_update().unwrap_err(),
        SnapshotError::InvalidTransition { op: "cancel_update", .. }
    ));
}

#[test]
fn begin_update_discards_stale_initiated_update() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();
    assert_eq!(snapshot_names(&fixture), vec!["system_b"]);

    // A second begin_update throws the first attempt away.
    fixture.manager.begin_update().unwrap();
    assert_eq!(state_file_contents(&fixture), "initiated");
    assert!(snapshot_names(&fixture).is_empty());
}

#[test]
fn cancel_update_is_a_noop_without_an_update() {
    let fixture = staged_fixture();
    fixture.manager.cancel_update().unwrap();
    assert_eq!(
        fixture.manager.get_update_state(None).unwrap(),
        UpdateState::None
    );
}

#[test]
fn finished_snapshot_writes_requires_initiated() {
    let fixture = staged_fixture();
    assert!(matches!(
        fixture.manager.finished_snapshot_writes().unwrap_err(),
        SnapshotError::InvalidTransition { .. }
    ));
}

#[test]
fn initiate_merge_refused_in_old_slot() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    fixture.manager.finished_snapshot_writes().unwrap();
    // Still booted in _a, which the boot indicator records.
    assert!(matches!(
        fixture.manager.initiate_merge().unwrap_err(),
        SnapshotError::RollbackDetected
    ));
}

#[test]
fn overlayfs_blocks_snapshot_creation() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    fixture.set_overlayfs(true);
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    assert!(matches!(
        fixture.manager.create_update_snapshots(&manifest).unwrap_err(),
        SnapshotError::MetadataInvalid { .. }
    ));
}

#[test]
fn reflashed_partition_is_mapped_plain_and_reaped() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();
    fixture.manager.finished_snapshot_writes().unwrap();

    fixture.reboot_into("_b");
    // Someone re-flashed system_b outside the updater: the metadata
    // attribute is gone.
    fixture
        .metadata
        .clear_updated_attr(TEST_SUPER, 1, "system_b");

    fixture
        .manager
        .create_logical_and_snapshot_partitions(TEST_SUPER)
        .unwrap();
    // Mapped plain: no snapshot stack.
    assert_eq!(fixture.mapper.device_names(), vec!["system_b".to_string()]);

    // Initiating the merge cannot rewrite the missing snapshot device, so
    // it parks the update at merge-failed without failing the call.
    fixture.manager.initiate_merge().unwrap();
    assert_eq!(state_file_contents(&fixture), "merge-failed");

    // The merge poll treats the stale snapshot as cancelled and deletes
    // it.
    let state = fixture.manager.process_update_state().unwrap();
    assert_eq!(state, UpdateState::Cancelled);
    assert!(snapshot_names(&fixture).is_empty());
    assert_eq!(state_file_contents(&fixture), "none");
}

#[test]
fn merge_failure_is_parked_and_retried() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();
    fixture.manager.finished_snapshot_writes().unwrap();

    fixture.reboot_into("_b");
    fixture
        .manager
        .create_logical_and_snapshot_partitions(TEST_SUPER)
        .unwrap();
    fixture.manager.initiate_merge().unwrap();

    // A reboot mid-merge tears every device down; without its device the
    // snapshot reads as failed and the state parks at merge-failed.
    fixture.mapper.clear();
    let state = fixture.manager.process_update_state().unwrap();
    assert_eq!(state, UpdateState::MergeFailed);
    assert_eq!(state_file_contents(&fixture), "merge-failed");

    // First-stage boot maps merge targets again (merging is global), and
    // the next poll completes.
    assert!(fixture.manager.need_snapshots_in_first_stage_mount());
    fixture
        .manager
        .create_logical_and_snapshot_partitions(TEST_SUPER)
        .unwrap();
    let inner = fixture.mapper.get_table("system_b-inner").unwrap();
    assert_eq!(inner[0].kind, "snapshot-merge");

    fixture.mapper.complete_merges();
    let state = fixture.manager.process_update_state().unwrap();
    assert_eq!(state, UpdateState::MergeCompleted);
    assert_eq!(state_file_contents(&fixture), "none");
}

#[test]
fn get_update_state_without_state_file() {
    let fixture = Fixture::new();
    let mut progress = -1.0;
    assert_eq!(
        fixture.manager.get_update_state(Some(&mut progress)).unwrap(),
        UpdateState::None
    );
    assert_eq!(progress, 0.0);
}

#[test]
fn dump_reports_store_contents() {
    let fixture = staged_fixture();
    fixture.manager.begin_update().unwrap();
    let manifest = fixture.system_manifest(8 * MIB, 1024);
    fixture.manager.create_update_snapshots(&manifest).unwrap();
    fixture.manager.finished_snapshot_writes().unwrap();

    let mut out = Vec::new();
    fixture.manager.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Update state: unverified"));
    assert!(text.contains("Boot indicator: old slot = _a"));
    assert!(text.contains("Snapshot: system_b"));
    assert!(text.contains("state: created"));
    assert!(text.contains(&format!("device size (bytes): {}", 8 * MIB)));
}
