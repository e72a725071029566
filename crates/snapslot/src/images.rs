//! File-backed block-device images.
//!
//! COW stores that do not fit in the super partition live as preallocated
//! files in a dedicated storage area and are exposed as block devices named
//! after the image. The local backend loops each file (`losetup`) and wraps
//! the loop device in a linear mapper device carrying the image name, so
//! the rest of the engine can address images exactly like any other mapped
//! device. A flat text index of `name loop-device` pairs survives restarts
//! so images can still be unmapped after a crash.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;

use crate::error::{Result, SnapshotError};
use crate::mapper::{BlockMapper, DmTarget};
use crate::state::SECTOR_SIZE;

/// Allocates, maps, and destroys file-backed block-device images.
pub trait ImageManager: Send + Sync {
    /// Allocate the backing store for a new image. Fails if the image
    /// already exists. `size_bytes` must be a multiple of 512.
    fn create_backing_image(&self, name: &str, size_bytes: u64) -> Result<()>;

    fn backing_image_exists(&self, name: &str) -> bool;

    /// Delete an image's backing store. The image must be unmapped.
    fn delete_backing_image(&self, name: &str) -> Result<()>;

    /// Map the image as a block device named `name`, waiting up to
    /// `timeout` for the node.
    fn map_image(&self, name: &str, timeout: Duration) -> Result<PathBuf>;

    /// First-stage variant: map through the supplied mapper handle without
    /// waiting on udev.
    fn map_image_with_mapper(&self, mapper: &dyn BlockMapper, name: &str) -> Result<PathBuf>;

    fn unmap_image_if_exists(&self, name: &str) -> Result<()>;
}

const LOOP_INDEX_FILE: &str = "loop-map";

/// Image backend that needs no services beyond the kernel: plain files,
/// loop devices, and the block mapper.
pub struct LocalImageManager {
    images_dir: PathBuf,
    mapper: std::sync::Arc<dyn BlockMapper>,
    /// Image name → loop device currently backing it.
    loops: Mutex<HashMap<String, String>>,
}

impl LocalImageManager {
    pub fn open(
        images_dir: impl Into<PathBuf>,
        mapper: std::sync::Arc<dyn BlockMapper>,
    ) -> Result<Self> {
        let images_dir = images_dir.into();
        fs::create_dir_all(&images_dir).map_err(|e| {
            SnapshotError::image(
                images_dir.display().to_string(),
                "open",
                anyhow::anyhow!("create {}: {e}", images_dir.display()),
            )
        })?;
        let loops = load_loop_index(&images_dir.join(LOOP_INDEX_FILE));
        Ok(LocalImageManager {
            images_dir,
            mapper,
            loops: Mutex::new(loops),
        })
    }

    fn image_path(&self, name: &str) -> PathBuf {
        self.images_dir.join(format!("{name}.img"))
    }

    fn save_index(&self, loops: &HashMap<String, String>) {
        let path = self.images_dir.join(LOOP_INDEX_FILE);
        let mut contents = String::new();
        for (name, device) in loops {
            contents.push_str(name);
            contents.push(' ');
            contents.push_str(device);
            contents.push('\n');
        }
        if let Err(e) = fs::write(&path, contents) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist loop index");
        }
    }

    fn map_with(&self, mapper: &dyn BlockMapper, name: &str, timeout: Duration) -> Result<PathBuf> {
        let path = self.image_path(name);
        if !path.exists() {
            return Err(SnapshotError::image(
                name,
                "map",
                anyhow::anyhow!("no backing image at {}", path.display()),
            ));
        }

        let loop_device = losetup_attach(&path).map_err(|e| SnapshotError::image(name, "map", e))?;
        let size_sectors = match fs::metadata(&path) {
            Ok(m) => m.len() / SECTOR_SIZE,
            Err(e) => {
                let _ = losetup_detach(&loop_device);
                return Err(SnapshotError::image(name, "map", anyhow::anyhow!("stat: {e}")));
            }
        };

        let table = [DmTarget::Linear {
            start_sector: 0,
            num_sectors: size_sectors,
            backing: loop_device.clone(),
            backing_sector: 0,
        }];
        let device_path = match mapper.create(name, &table, timeout) {
            Ok(p) => p,
            Err(e) => {
                let _ = losetup_detach(&loop_device);
                return Err(e);
            }
        };

        let mut loops = self.loops.lock().expect("loop index lock poisoned");
        loops.insert(name.to_string(), loop_device);
        self.save_index(&loops);

        tracing::info!(image = %name, device = %device_path.display(), "Mapped backing image");
        Ok(device_path)
    }
}

impl ImageManager for LocalImageManager {
    fn create_backing_image(&self, name: &str, size_bytes: u64) -> Result<()> {
        if size_bytes % SECTOR_SIZE != 0 {
            return Err(SnapshotError::SizeUnaligned {
                what: "image size",
                value: size_bytes,
            });
        }
        let path = self.image_path(name);
        if path.exists() {
            return Err(SnapshotError::image(
                name,
                "create",
                anyhow::anyhow!("image already exists at {}", path.display()),
            ));
        }
        let create = || -> anyhow::Result<()> {
            let file = fs::File::create(&path)
                .with_context(|| format!("create {}", path.display()))?;
            file.set_len(size_bytes)
                .with_context(|| format!("allocate {size_bytes} bytes for {}", path.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", path.display()))?;
            Ok(())
        };
        if let Err(e) = create() {
            let _ = fs::remove_file(&path);
            return Err(SnapshotError::image(name, "create", e));
        }
        tracing::info!(image = %name, size_bytes, "Created backing image");
        Ok(())
    }

    fn backing_image_exists(&self, name: &str) -> bool {
        self.image_path(name).exists()
    }

    fn delete_backing_image(&self, name: &str) -> Result<()> {
        {
            let loops = self.loops.lock().expect("loop index lock poisoned");
            if loops.contains_key(name) {
                return Err(SnapshotError::image(
                    name,
                    "delete",
                    anyhow::anyhow!("image is still mapped"),
                ));
            }
        }
        let path = self.image_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnapshotError::image(
                name,
                "delete",
                anyhow::anyhow!("remove {}: {e}", path.display()),
            )),
        }
    }

    fn map_image(&self, name: &str, timeout: Duration) -> Result<PathBuf> {
        self.map_with(self.mapper.as_ref(), name, timeout)
    }

    fn map_image_with_mapper(&self, mapper: &dyn BlockMapper, name: &str) -> Result<PathBuf> {
        // First-stage boot has no udev, so skip the node wait entirely.
        self.map_with(mapper, name, Duration::ZERO)
    }

    fn unmap_image_if_exists(&self, name: &str) -> Result<()> {
        self.mapper.delete_if_exists(name)?;
        let mut loops = self.loops.lock().expect("loop index lock poisoned");
        if let Some(loop_device) = loops.remove(name) {
            if let Err(e) = losetup_detach(&loop_device) {
                loops.insert(name.to_string(), loop_device);
                self.save_index(&loops);
                return Err(SnapshotError::image(name, "unmap", e));
            }
            self.save_index(&loops);
            tracing::info!(image = %name, "Unmapped backing image");
        }
        Ok(())
    }
}

fn load_loop_index(path: &Path) -> HashMap<String, String> {
    let mut loops = HashMap::new();
    if let Ok(contents) = fs::read_to_string(path) {
        for line in contents.lines() {
            if let Some((name, device)) = line.trim().split_once(' ') {
                loops.insert(name.to_string(), device.to_string());
            }
        }
    }
    loops
}

fn losetup_attach(path: &Path) -> anyhow::Result<String> {
    let output = std::process::Command::new("losetup")
        .args(["--find", "--show"])
        .arg(path)
        .output()
        .context("failed to execute losetup")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "losetup {} failed (exit {}): {}",
            path.display(),
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn losetup_detach(device: &str) -> anyhow::Result<()> {
    let output = std::process::Command::new("losetup")
        .args(["-d", device])
        .output()
        .context("failed to execute losetup -d")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "losetup -d {device} failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Loop-device mapping needs root and a kernel, so only the pure file
    // paths are covered here; mapping is exercised against the fake image
    // manager in the engine tests.

    struct NoopMapper;

    impl BlockMapper for NoopMapper {
        fn create(&self, name: &str, _table: &[DmTarget], _timeout: Duration) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("/dev/mapper/{name}")))
        }
        fn load_table_and_activate(&self, _name: &str, _table: &[DmTarget]) -> Result<()> {
            Ok(())
        }
        fn delete_if_exists(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn device_exists(&self, _name: &str) -> bool {
            false
        }
        fn get_table(&self, _name: &str) -> Result<Vec<crate::mapper::TargetEntry>> {
            Ok(Vec::new())
        }
        fn get_status(&self, _name: &str) -> Result<Vec<crate::mapper::TargetStatus>> {
            Ok(Vec::new())
        }
        fn get_device_string(&self, _name: &str) -> Result<String> {
            Ok("0:0".to_string())
        }
        fn get_device_path(&self, name: &str) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("/dev/mapper/{name}")))
        }
    }

    fn manager() -> (tempfile::TempDir, LocalImageManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            LocalImageManager::open(dir.path(), std::sync::Arc::new(NoopMapper)).unwrap();
        (dir, manager)
    }

    #[test]
    fn create_and_delete_backing_image() {
        let (_dir, manager) = manager();
        manager.create_backing_image("system_b-cow-img", 8192).unwrap();
        assert!(manager.backing_image_exists("system_b-cow-img"));
        let path = manager.image_path("system_b-cow-img");
        assert_eq!(fs::metadata(&path).unwrap().len(), 8192);

        manager.delete_backing_image("system_b-cow-img").unwrap();
        assert!(!manager.backing_image_exists("system_b-cow-img"));
        // Deleting a missing image is fine.
        manager.delete_backing_image("system_b-cow-img").unwrap();
    }

    #[test]
    fn create_rejects_duplicates_and_unaligned_sizes() {
        let (_dir, manager) = manager();
        manager.create_backing_image("a", 4096).unwrap();
        assert!(manager.create_backing_image("a", 4096).is_err());
        assert!(matches!(
            manager.create_backing_image("b", 1000).unwrap_err(),
            SnapshotError::SizeUnaligned { .. }
        ));
        assert!(!manager.backing_image_exists("b"));
    }

    #[test]
    fn loop_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join(LOOP_INDEX_FILE);
        fs::write(&index_path, "system_b-cow-img /dev/loop3\n").unwrap();
        let loops = load_loop_index(&index_path);
        assert_eq!(
            loops.get("system_b-cow-img").map(String::as_str),
            Some("/dev/loop3")
        );
    }
}
