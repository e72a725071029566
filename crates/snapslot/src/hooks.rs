//! Device capability record.
//!
//! Slot selection and the super-partition path are controlled by the
//! bootloader and platform glue, not by this engine. Rather than an
//! interface hierarchy, the engine takes a record of callables so tests and
//! first-stage boot can supply whatever environment they have.

type StringFn = Box<dyn Fn() -> String + Send + Sync>;
type SuperFn = Box<dyn Fn(u32) -> String + Send + Sync>;
type BoolFn = Box<dyn Fn() -> bool + Send + Sync>;

pub struct DeviceHooks {
    /// Suffix of the currently booted slot (e.g. `_a`).
    pub slot_suffix: StringFn,
    /// Suffix of the other slot.
    pub other_slot_suffix: StringFn,
    /// Path of the super partition backing the given slot number.
    pub super_device: SuperFn,
    /// Whether scratch overlays are mounted over the system partitions.
    /// Snapshot creation is refused while they are.
    pub is_overlayfs_setup: BoolFn,
}

impl DeviceHooks {
    pub fn slot_suffix(&self) -> String {
        (self.slot_suffix)()
    }

    pub fn other_slot_suffix(&self) -> String {
        (self.other_slot_suffix)()
    }

    pub fn super_device(&self, slot: u32) -> String {
        (self.super_device)(slot)
    }

    pub fn is_overlayfs_setup(&self) -> bool {
        (self.is_overlayfs_setup)()
    }
}

impl std::fmt::Debug for DeviceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHooks")
            .field("slot_suffix", &self.slot_suffix())
            .finish_non_exhaustive()
    }
}

/// Map a slot suffix to its slot number (`_a` → 0, `_b` → 1). Unknown
/// suffixes map to slot 0, matching the bootloader's fallback.
pub fn slot_number(suffix: &str) -> u32 {
    match suffix {
        "_b" => 1,
        _ => 0,
    }
}
