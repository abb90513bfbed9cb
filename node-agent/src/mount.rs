//! Mount engine: format, mount, online resize, and unmount, for both
//! filesystem volumes and raw block volumes.
//!
//! Raw block volumes skip formatting entirely and are bind-mounted as a
//! regular file at the target path (not a directory), matching how the
//! kubelet expects a block-mode staging target to look.

use std::fs;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use csi_common::validation::validate_mount_options;
use csi_common::{DriverError, DriverResult};

const SUPPORTED_FS_TYPES: &[&str] = &["ext4", "xfs"];

pub struct MountEngine;

impl Default for MountEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MountEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_fs_type(&self, fs_type: &str) -> DriverResult<&'static str> {
        match fs_type.to_lowercase().as_str() {
            "ext4" | "" => Ok("ext4"),
            "xfs" => Ok("xfs"),
            other => Err(DriverError::invalid_argument(format!(
                "unsupported filesystem type: {other}. supported: {}",
                SUPPORTED_FS_TYPES.join(", ")
            ))),
        }
    }

    /// Format `device` with `fs_type` unless it already carries a
    /// recognized filesystem signature.
    pub fn format(&self, device: &str, fs_type: &str) -> DriverResult<()> {
        if !self.needs_formatting(device)? {
            debug!(device = %device, "device already formatted, skipping");
            return Ok(());
        }

        let fs_type = self.validate_fs_type(fs_type)?;
        info!(device = %device, fs_type = %fs_type, "formatting device");

        let mkfs = match fs_type {
            "ext4" => "mkfs.ext4",
            "xfs" => "mkfs.xfs",
            _ => unreachable!("validate_fs_type already rejected unknown types"),
        };
        let force_flag = if fs_type == "xfs" { "-f" } else { "-F" };

        let output = Command::new(mkfs)
            .args([force_flag, device])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute {mkfs}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::internal(format!("{mkfs} failed: {stderr}")));
        }
        Ok(())
    }

    fn needs_formatting(&self, device: &str) -> DriverResult<bool> {
        let output = Command::new("blkid")
            .args(["-p", device])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute blkid: {e}")))?;
        if !output.status.success() {
            return Ok(true);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.contains("TYPE="))
    }

    /// Mount a filesystem device at `target` with an allowlisted set of
    /// mount options.
    pub fn mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> DriverResult<()> {
        validate_mount_options(options)?;
        let fs_type = self.validate_fs_type(fs_type)?;

        fs::create_dir_all(target)
            .map_err(|e| DriverError::internal(format!("failed to create mount target: {e}")))?;

        let mut args = vec!["-t".to_string(), fs_type.to_string()];
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.join(","));
        }
        args.push(device.to_string());
        args.push(target.to_string());

        info!(device = %device, target = %target, fs_type = %fs_type, "mounting device");
        let output = Command::new("mount")
            .args(&args)
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute mount: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::internal(format!("mount failed: {stderr}")));
        }
        Ok(())
    }

    /// Bind a raw block device to a regular file at `target` (block-mode
    /// staging: the target must be a file, not a directory).
    pub fn bind_raw_block(&self, device: &str, target: &str) -> DriverResult<()> {
        if let Some(parent) = Path::new(target).parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DriverError::internal(format!("failed to create parent dir: {e}")))?;
        }
        if !Path::new(target).exists() {
            fs::File::create(target)
                .map_err(|e| DriverError::internal(format!("failed to create bind target file: {e}")))?;
        }

        info!(device = %device, target = %target, "bind-mounting raw block device");
        let output = Command::new("mount")
            .args(["--bind", device, target])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute mount --bind: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::internal(format!("bind mount failed: {stderr}")));
        }
        Ok(())
    }

    /// Bind-mount the already-mounted staging directory onto the publish
    /// target directory (the NodePublishVolume side of a mount-volume
    /// staging/publish pair).
    pub fn bind_mount_dir(&self, staging_path: &str, target: &str, readonly: bool) -> DriverResult<()> {
        fs::create_dir_all(target)
            .map_err(|e| DriverError::internal(format!("failed to create publish target: {e}")))?;

        info!(staging_path = %staging_path, target = %target, readonly, "bind-mounting staged directory");
        let output = Command::new("mount")
            .args(["--bind", staging_path, target])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute mount --bind: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::internal(format!("bind mount failed: {stderr}")));
        }

        if readonly {
            let output = Command::new("mount")
                .args(["-o", "remount,bind,ro", target])
                .output()
                .map_err(|e| DriverError::internal(format!("failed to execute remount: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(DriverError::internal(format!("readonly remount failed: {stderr}")));
            }
        }
        Ok(())
    }

    /// Grow the filesystem at `device` online. No-op if the current size is
    /// already at least `requested_bytes`.
    pub fn resize(&self, device: &str, fs_type: &str, requested_bytes: u64) -> DriverResult<()> {
        let current = self.device_size_bytes(device)?;
        if current >= requested_bytes {
            debug!(device = %device, current, requested_bytes, "device already large enough, skipping resize");
            return Ok(());
        }

        let fs_type = self.validate_fs_type(fs_type)?;
        info!(device = %device, fs_type = %fs_type, requested_bytes, "growing filesystem online");

        let (program, args): (&str, Vec<String>) = match fs_type {
            "ext4" => ("resize2fs", vec![device.to_string()]),
            "xfs" => ("xfs_growfs", vec![device.to_string()]),
            _ => unreachable!("validate_fs_type already rejected unknown types"),
        };
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::internal(format!("{program} failed: {stderr}")));
        }
        Ok(())
    }

    fn device_size_bytes(&self, device: &str) -> DriverResult<u64> {
        let output = Command::new("blockdev")
            .args(["--getsize64", device])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute blockdev: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::internal(format!("blockdev failed: {stderr}")));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| DriverError::internal(format!("unexpected blockdev output: {e}")))
    }

    /// Unmount `target`; idempotent, and removes the target if it ends up
    /// empty.
    pub fn unmount(&self, target: &str) -> DriverResult<()> {
        if !self.is_mounted(target)? {
            debug!(target = %target, "target is not mounted, skipping unmount");
            return Ok(());
        }

        let output = Command::new("umount")
            .arg(target)
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute umount: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target, "target was not mounted");
                return Ok(());
            }
            return Err(DriverError::internal(format!("umount failed: {stderr}")));
        }
        self.remove_if_empty(target);
        Ok(())
    }

    /// Lazy unmount, used by the stale-mount recoverer when the device is
    /// gone and a normal unmount would block.
    pub fn lazy_unmount(&self, target: &str) -> DriverResult<()> {
        let output = Command::new("umount")
            .args(["-l", target])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute umount -l: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") {
                return Ok(());
            }
            return Err(DriverError::internal(format!("lazy umount failed: {stderr}")));
        }
        self.remove_if_empty(target);
        Ok(())
    }

    fn remove_if_empty(&self, target: &str) {
        if let Ok(mut entries) = fs::read_dir(target)
            && entries.next().is_none()
        {
            let _ = fs::remove_dir(target);
        }
    }

    pub fn is_mounted(&self, target: &str) -> DriverResult<bool> {
        let mounts = fs::read_to_string("/proc/mounts")
            .map_err(|e| DriverError::internal(format!("failed to read /proc/mounts: {e}")))?;
        Ok(mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_supported_fs_types() {
        let engine = MountEngine::new();
        assert_eq!(engine.validate_fs_type("ext4").unwrap(), "ext4");
        assert_eq!(engine.validate_fs_type("").unwrap(), "ext4");
        assert_eq!(engine.validate_fs_type("xfs").unwrap(), "xfs");
        assert!(engine.validate_fs_type("zfs").is_err());
    }

    #[test]
    fn mount_rejects_disallowed_options() {
        let engine = MountEngine::new();
        let result = engine.mount(
            "/dev/nvme0n1",
            "/mnt/target",
            "ext4",
            &["suid".to_string()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn is_mounted_reads_proc_mounts() {
        let engine = MountEngine::new();
        // /proc/mounts always has at least the root filesystem.
        let result = engine.is_mounted("/nonexistent-target-for-test");
        assert!(result.is_ok());
        assert!(!result.unwrap());
    }
}
