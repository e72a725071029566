//! Block-mapper interface and the `dmsetup` production backend.
//!
//! The engine composes virtual block devices out of tables of targets:
//! `linear` ranges over a backing device, and `snapshot` /
//! `snapshot-merge` overlays pairing a base device with a COW store.
//! Table and status strings follow the kernel device-mapper formats:
//!
//! ```text
//! 0 <sectors> linear <backing> <backing_sector>
//! 0 <sectors> snapshot <base> <cow> P <chunk_sectors>
//! status: 0 <sectors> snapshot <allocated>/<total> <metadata_sectors>
//! ```
//!
//! All production operations go through `dmsetup`, so no libdevmapper
//! build dependency is needed.

use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};

use crate::error::{Result, SnapshotError};

/// How the snapshot target treats the COW store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Writes are redirected into the COW store (`snapshot`).
    Persistent,
    /// The COW store is drained back into the base device
    /// (`snapshot-merge`).
    Merge,
}

/// One target in a device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmTarget {
    Linear {
        start_sector: u64,
        num_sectors: u64,
        /// Backing device path or `major:minor` string.
        backing: String,
        backing_sector: u64,
    },
    Snapshot {
        num_sectors: u64,
        base: String,
        cow: String,
        mode: SnapshotMode,
        chunk_sectors: u32,
    },
}

impl DmTarget {
    pub fn num_sectors(&self) -> u64 {
        match self {
            DmTarget::Linear { num_sectors, .. } => *num_sectors,
            DmTarget::Snapshot { num_sectors, .. } => *num_sectors,
        }
    }

    /// Render the `dmsetup` table line for this target.
    pub fn to_table_line(&self) -> String {
        match self {
            DmTarget::Linear {
                start_sector,
                num_sectors,
                backing,
                backing_sector,
            } => format!("{start_sector} {num_sectors} linear {backing} {backing_sector}"),
            DmTarget::Snapshot {
                num_sectors,
                base,
                cow,
                mode,
                chunk_sectors,
            } => {
                let kind = match mode {
                    SnapshotMode::Persistent => "snapshot",
                    SnapshotMode::Merge => "snapshot-merge",
                };
                // P = persistent exception store; merge targets share it.
                format!("0 {num_sectors} {kind} {base} {cow} P {chunk_sectors}")
            }
        }
    }
}

/// One entry of a queried device table (`dmsetup table`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub kind: String,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub params: String,
}

impl TargetEntry {
    /// For a `snapshot`/`snapshot-merge` entry, the base and COW device
    /// strings from the parameters.
    pub fn snapshot_devices(&self) -> Result<(String, String)> {
        let mut fields = self.params.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(base), Some(cow)) => Ok((base.to_string(), cow.to_string())),
            _ => Err(SnapshotError::corrupt(format!(
                "snapshot target parameters {:?} missing devices",
                self.params
            ))),
        }
    }
}

/// One entry of a queried device status (`dmsetup status`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub kind: String,
    pub status: String,
}

/// Decoded status of a `snapshot`/`snapshot-merge` target. Merging is
/// complete when `sectors_allocated == metadata_sectors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTargetStatus {
    pub sectors_allocated: u64,
    pub total_sectors: u64,
    pub metadata_sectors: u64,
}

/// Parse the status bytes of a snapshot target:
/// `<allocated>/<total> <metadata_sectors>`. The kernel reports `Invalid`
/// or `Overflow` for broken stores; both are surfaced as corruption.
pub fn parse_snapshot_status(status: &str) -> Result<SnapshotTargetStatus> {
    let status = status.trim();
    if status == "Invalid" || status == "Overflow" {
        return Err(SnapshotError::corrupt(format!(
            "kernel reports snapshot store {status}"
        )));
    }
    let mut fields = status.split_whitespace();
    let fraction = fields
        .next()
        .ok_or_else(|| SnapshotError::corrupt("empty snapshot status"))?;
    let metadata = fields
        .next()
        .ok_or_else(|| SnapshotError::corrupt("snapshot status missing metadata sectors"))?;
    let (allocated, total) = fraction
        .split_once('/')
        .ok_or_else(|| SnapshotError::corrupt(format!("bad snapshot fraction {fraction:?}")))?;

    let parse = |what: &str, s: &str| -> Result<u64> {
        s.parse::<u64>()
            .map_err(|_| SnapshotError::corrupt(format!("bad {what} {s:?} in snapshot status")))
    };
    Ok(SnapshotTargetStatus {
        sectors_allocated: parse("allocated sectors", allocated)?,
        total_sectors: parse("total sectors", total)?,
        metadata_sectors: parse("metadata sectors", metadata)?,
    })
}

/// Kernel-backed composer of virtual block devices. The engine owns only
/// its own device names; the mapper namespace is global.
pub trait BlockMapper: Send + Sync {
    /// Create and activate a device, waiting up to `timeout` for its node
    /// to appear. A zero timeout skips the wait. On timeout the device is
    /// deleted again and [`SnapshotError::Timeout`] is returned.
    fn create(&self, name: &str, table: &[DmTarget], timeout: Duration) -> Result<PathBuf>;

    /// Atomically swap an active device's table without tearing it down.
    fn load_table_and_activate(&self, name: &str, table: &[DmTarget]) -> Result<()>;

    fn delete_if_exists(&self, name: &str) -> Result<()>;

    fn device_exists(&self, name: &str) -> bool;

    fn get_table(&self, name: &str) -> Result<Vec<TargetEntry>>;

    fn get_status(&self, name: &str) -> Result<Vec<TargetStatus>>;

    /// `major:minor` string for a device, usable as a backing-device
    /// reference before udev has produced nodes.
    fn get_device_string(&self, name: &str) -> Result<String>;

    fn get_device_path(&self, name: &str) -> Result<PathBuf>;
}

/// Production mapper backend driving `dmsetup`.
#[derive(Debug, Clone)]
pub struct DmsetupMapper {
    dev_dir: PathBuf,
}

/// Poll interval while waiting for a device node to appear.
const NODE_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Retries for `dmsetup remove` when the device is momentarily busy.
const REMOVE_RETRIES: u32 = 5;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(200);

impl DmsetupMapper {
    pub fn new() -> Self {
        DmsetupMapper {
            dev_dir: PathBuf::from("/dev/mapper"),
        }
    }

    pub fn with_dev_dir(dev_dir: impl Into<PathBuf>) -> Self {
        DmsetupMapper {
            dev_dir: dev_dir.into(),
        }
    }

    fn node_path(&self, name: &str) -> PathBuf {
        self.dev_dir.join(name)
    }

    fn render_table(table: &[DmTarget]) -> String {
        table
            .iter()
            .map(DmTarget::to_table_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for DmsetupMapper {
    fn default() -> Self {
        DmsetupMapper::new()
    }
}

impl BlockMapper for DmsetupMapper {
    fn create(&self, name: &str, table: &[DmTarget], timeout: Duration) -> Result<PathBuf> {
        let table_text = Self::render_table(table);
        run_cmd_stdin("dmsetup", &["create", name], &table_text)
            .map_err(|e| SnapshotError::mapper(name, "create", e))?;

        let node = self.node_path(name);
        if timeout.is_zero() {
            return Ok(node);
        }
        let deadline = Instant::now() + timeout;
        while !node.exists() {
            if Instant::now() >= deadline {
                tracing::error!(device = %name, "Device node did not appear, deleting");
                let _ = self.delete_if_exists(name);
                return Err(SnapshotError::Timeout {
                    name: name.to_string(),
                });
            }
            std::thread::sleep(NODE_POLL_INTERVAL);
        }
        Ok(node)
    }

    fn load_table_and_activate(&self, name: &str, table: &[DmTarget]) -> Result<()> {
        let table_text = Self::render_table(table);
        run_cmd_stdin("dmsetup", &["load", name], &table_text)
            .map_err(|e| SnapshotError::mapper(name, "load-table", e))?;
        run_cmd("dmsetup", &["resume", name])
            .map_err(|e| SnapshotError::mapper(name, "resume", e))?;
        Ok(())
    }

    fn delete_if_exists(&self, name: &str) -> Result<()> {
        if !self.device_exists(name) {
            return Ok(());
        }
        for attempt in 0..REMOVE_RETRIES {
            match run_cmd("dmsetup", &["remove", name]) {
                Ok(_) => return Ok(()),
                Err(_) if attempt + 1 < REMOVE_RETRIES => {
                    tracing::debug!(device = %name, attempt = attempt + 1, "dmsetup remove busy, retrying");
                    std::thread::sleep(REMOVE_RETRY_DELAY);
                    if !self.device_exists(name) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(SnapshotError::mapper(name, "delete", e)),
            }
        }
        Ok(())
    }

    fn device_exists(&self, name: &str) -> bool {
        self.node_path(name).exists()
    }

    fn get_table(&self, name: &str) -> Result<Vec<TargetEntry>> {
        let output =
            run_cmd("dmsetup", &["table", name]).map_err(|e| SnapshotError::mapper(name, "table", e))?;
        parse_table_output(&output)
    }

    fn get_status(&self, name: &str) -> Result<Vec<TargetStatus>> {
        let output = run_cmd("dmsetup", &["status", name])
            .map_err(|e| SnapshotError::mapper(name, "status", e))?;
        let entries = parse_table_output(&output)?;
        Ok(entries
            .into_iter()
            .map(|e| TargetStatus {
                kind: e.kind,
                status: e.params,
            })
            .collect())
    }

    fn get_device_string(&self, name: &str) -> Result<String> {
        let node = self.node_path(name);
        let metadata = std::fs::metadata(&node)
            .with_context(|| format!("cannot stat device node {}", node.display()))
            .map_err(|e| SnapshotError::mapper(name, "stat", e))?;
        let rdev = metadata.rdev();
        let major = nix::sys::stat::major(rdev);
        let minor = nix::sys::stat::minor(rdev);
        Ok(format!("{major}:{minor}"))
    }

    fn get_device_path(&self, name: &str) -> Result<PathBuf> {
        let node = self.node_path(name);
        if !node.exists() {
            return Err(SnapshotError::mapper(
                name,
                "path",
                anyhow::anyhow!("device node {} does not exist", node.display()),
            ));
        }
        Ok(node)
    }
}

/// Parse `dmsetup table`/`status` output: one line per target,
/// `<start> <sectors> <kind> <params...>`.
fn parse_table_output(output: &str) -> Result<Vec<TargetEntry>> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, ' ');
        let (start, sectors, kind) = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(SnapshotError::corrupt(format!(
                    "unparseable device table line {line:?}"
                )))
            }
        };
        entries.push(TargetEntry {
            kind: kind.to_string(),
            start_sector: start.parse::<u64>().map_err(|_| {
                SnapshotError::corrupt(format!("bad start sector in table line {line:?}"))
            })?,
            num_sectors: sectors.parse::<u64>().map_err(|_| {
                SnapshotError::corrupt(format!("bad sector count in table line {line:?}"))
            })?,
            params: fields.next().unwrap_or("").trim().to_string(),
        });
    }
    Ok(entries)
}

/// Run a command and capture stdout. Non-zero exit becomes an error with
/// trimmed stderr.
fn run_cmd(cmd: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = std::process::Command::new(cmd)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .with_context(|| format!("failed to execute: {cmd} {args:?}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{cmd} {args:?} failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a command feeding `stdin_data` on stdin.
fn run_cmd_stdin(cmd: &str, args: &[&str], stdin_data: &str) -> anyhow::Result<String> {
    let mut child = std::process::Command::new(cmd)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn: {cmd} {args:?}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_data.as_bytes())
            .with_context(|| format!("failed to write stdin to {cmd} {args:?}"))?;
    }

    let output = child
        .wait_with_output()
        .with_context(|| format!("failed to wait for: {cmd} {args:?}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{cmd} {args:?} failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_table_line() {
        let target = DmTarget::Linear {
            start_sector: 8,
            num_sectors: 16,
            backing: "253:2".to_string(),
            backing_sector: 8,
        };
        assert_eq!(target.to_table_line(), "8 16 linear 253:2 8");
    }

    #[test]
    fn snapshot_table_lines() {
        let mut target = DmTarget::Snapshot {
            num_sectors: 16,
            base: "253:1".to_string(),
            cow: "253:2".to_string(),
            mode: SnapshotMode::Persistent,
            chunk_sectors: 8,
        };
        assert_eq!(target.to_table_line(), "0 16 snapshot 253:1 253:2 P 8");
        if let DmTarget::Snapshot { mode, .. } = &mut target {
            *mode = SnapshotMode::Merge;
        }
        assert_eq!(target.to_table_line(), "0 16 snapshot-merge 253:1 253:2 P 8");
    }

    #[test]
    fn parse_snapshot_status_counters() {
        let status = parse_snapshot_status("16/4096 16").unwrap();
        assert_eq!(status.sectors_allocated, 16);
        assert_eq!(status.total_sectors, 4096);
        assert_eq!(status.metadata_sectors, 16);
    }

    #[test]
    fn parse_snapshot_status_rejects_invalid_store() {
        assert!(parse_snapshot_status("Invalid").is_err());
        assert!(parse_snapshot_status("Overflow").is_err());
        assert!(parse_snapshot_status("garbage").is_err());
        assert!(parse_snapshot_status("1/2").is_err());
    }

    #[test]
    fn parse_table_lines() {
        let entries = parse_table_output(
            "0 8 linear 253:0 0\n8 8 linear 253:1 8\n",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "linear");
        assert_eq!(entries[0].num_sectors, 8);
        assert_eq!(entries[1].start_sector, 8);
        assert_eq!(entries[1].params, "253:1 8");
    }

    #[test]
    fn snapshot_devices_from_params() {
        let entry = TargetEntry {
            kind: "snapshot".to_string(),
            start_sector: 0,
            num_sectors: 8,
            params: "253:1 253:2 P 8".to_string(),
        };
        assert_eq!(
            entry.snapshot_devices().unwrap(),
            ("253:1".to_string(), "253:2".to_string())
        );
    }
}
