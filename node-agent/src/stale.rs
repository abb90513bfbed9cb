//! Stale-mount detection and recovery.
//!
//! A mount is stale when it is still listed in `/proc/self/mountinfo` but
//! its underlying device node has dropped out of sysfs -- the NVMe link
//! died while something still had the mount open. Recovery unmounts lazily,
//! reconnects the NVMe target, re-resolves the device, and remounts.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use csi_common::{DriverError, DriverResult};

use crate::metrics;
use crate::mount::MountEngine;
use crate::nvme::{NvmeConnectParams, NvmeConnector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoEntry {
    pub mount_point: String,
    pub major_minor: String,
    pub source: String,
}

pub struct StaleMountDetector;

impl Default for StaleMountDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl StaleMountDetector {
    pub fn new() -> Self {
        Self
    }

    fn find_mount(&self, mount_point: &str) -> DriverResult<Option<MountInfoEntry>> {
        let contents = fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| DriverError::internal(format!("failed to read /proc/self/mountinfo: {e}")))?;
        Ok(parse_mountinfo(&contents)
            .into_iter()
            .find(|entry| entry.mount_point == mount_point))
    }

    /// `true` if `mount_point` is mounted but its device no longer exists
    /// in sysfs. `false` if it is mounted and healthy, or not mounted at
    /// all (not-mounted is not this detector's concern).
    pub fn is_stale(&self, mount_point: &str) -> DriverResult<bool> {
        let Some(entry) = self.find_mount(mount_point)? else {
            return Ok(false);
        };
        let sysfs_path = format!("/sys/dev/block/{}", entry.major_minor);
        Ok(!Path::new(&sysfs_path).exists())
    }

    /// Unmount (lazily), reconnect the NVMe target, re-resolve the device,
    /// and remount. Returns the re-resolved device path on success.
    #[allow(clippy::too_many_arguments)]
    pub fn recover(
        &self,
        mount_point: &str,
        connect_params: &NvmeConnectParams,
        fs_type: &str,
        options: &[String],
        raw_block: bool,
        connector: &NvmeConnector,
        mount_engine: &MountEngine,
        resolve_timeout: Duration,
    ) -> DriverResult<String> {
        warn!(mount_point = %mount_point, nqn = %connect_params.nqn, "recovering stale mount");

        mount_engine.lazy_unmount(mount_point)?;
        connector.disconnect(&connect_params.nqn)?;
        connector.connect(connect_params)?;
        let device = connector.resolve_device(&connect_params.nqn, resolve_timeout)?;

        if raw_block {
            mount_engine.bind_raw_block(&device, mount_point)?;
        } else {
            mount_engine.mount(&device, mount_point, fs_type, options)?;
        }

        info!(mount_point = %mount_point, device = %device, "stale mount recovered");
        metrics::record_stale_mount_recovery();
        Ok(device)
    }
}

fn parse_mountinfo(contents: &str) -> Vec<MountInfoEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // mountinfo: id parent major:minor root mount-point options* - fstype source superopts
            let separator_idx = fields.iter().position(|&f| f == "-")?;
            if fields.len() < 5 || separator_idx + 2 >= fields.len() {
                return None;
            }
            Some(MountInfoEntry {
                mount_point: fields[4].to_string(),
                major_minor: fields[2].to_string(),
                source: fields[separator_idx + 2].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mountinfo_line() {
        let line = "36 35 0:32 / /mnt/volume1 rw,relatime shared:1 - ext4 /dev/nvme0n1 rw,errors=remount-ro";
        let entries = parse_mountinfo(line);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_point, "/mnt/volume1");
        assert_eq!(entries[0].major_minor, "0:32");
        assert_eq!(entries[0].source, "/dev/nvme0n1");
    }

    #[test]
    fn ignores_malformed_lines() {
        assert!(parse_mountinfo("not a real mountinfo line").is_empty());
    }

    #[test]
    fn is_stale_returns_false_for_unmounted_path() {
        let detector = StaleMountDetector::new();
        let result = detector.is_stale("/definitely/not/a/real/mount/point/for/tests");
        assert!(matches!(result, Ok(false)));
    }
}
