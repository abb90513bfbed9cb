//! NVMe/TCP connector: wraps `nvme-cli` as a subprocess, augmented by direct
//! sysfs reads to resolve the resulting block device and to detect orphaned
//! subsystems at startup.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use csi_common::{DriverError, DriverResult};

#[derive(Debug, Clone)]
pub struct NvmeConnectParams {
    pub target_ip: String,
    pub target_port: u16,
    pub nqn: String,
    /// `-l`: controller-loss timeout in seconds. -1 means unlimited reconnection.
    pub ctrl_loss_tmo: i64,
    /// `-c`: reconnect delay in seconds.
    pub reconnect_delay: u32,
    /// `-k`: keep-alive timeout in seconds, if the caller wants one.
    pub keep_alive_tmo: Option<u32>,
}

pub struct NvmeConnector;

impl Default for NvmeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeConnector {
    pub fn new() -> Self {
        Self
    }

    /// Issue `nvme connect`. Returns once the subsystem is registered; the
    /// block device may not exist yet -- call `resolve_device` next.
    pub fn connect(&self, params: &NvmeConnectParams) -> DriverResult<()> {
        info!(
            nqn = %params.nqn,
            target_ip = %params.target_ip,
            target_port = params.target_port,
            "connecting nvme/tcp target"
        );

        let mut args = vec![
            "connect".to_string(),
            "-t".to_string(),
            "tcp".to_string(),
            "-a".to_string(),
            params.target_ip.clone(),
            "-s".to_string(),
            params.target_port.to_string(),
            "-n".to_string(),
            params.nqn.clone(),
            "-l".to_string(),
            params.ctrl_loss_tmo.to_string(),
            "-c".to_string(),
            params.reconnect_delay.to_string(),
        ];
        if let Some(keep_alive) = params.keep_alive_tmo {
            args.push("-k".to_string());
            args.push(keep_alive.to_string());
        }

        let output = Command::new("nvme").args(&args).output().map_err(|e| {
            DriverError::internal(format!("failed to execute nvme connect: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already connected") {
                info!(nqn = %params.nqn, "nvme subsystem already connected");
                return Ok(());
            }
            return Err(DriverError::unavailable(format!(
                "nvme connect failed for {}: {stderr}",
                params.nqn
            )));
        }
        Ok(())
    }

    /// Poll `/sys/class/nvme/*/subsysnqn` for a matching subsystem, then
    /// enumerate its namespaces to derive a `/dev/nvme*n*` path.
    pub fn resolve_device(&self, nqn: &str, poll_timeout: Duration) -> DriverResult<String> {
        let poll_interval = Duration::from_millis(200);
        let deadline = Instant::now() + poll_timeout;
        let mut subsystem_seen = false;

        loop {
            if let Some(subsys_path) = find_subsystem_path(nqn)? {
                subsystem_seen = true;
                if let Some(device) = find_namespace_device(&subsys_path)? {
                    return Ok(device);
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(poll_interval);
        }

        if subsystem_seen {
            Err(DriverError::unavailable(format!(
                "nvme subsystem for {nqn} is connected but no namespace device appeared within {poll_timeout:?}"
            )))
        } else {
            Err(DriverError::unavailable(format!(
                "nvme subsystem for {nqn} did not appear within {poll_timeout:?}"
            )))
        }
    }

    /// Idempotent: not-found on disconnect is success.
    pub fn disconnect(&self, nqn: &str) -> DriverResult<()> {
        info!(nqn = %nqn, "disconnecting nvme/tcp target");
        let output = Command::new("nvme")
            .args(["disconnect", "-n", nqn])
            .output()
            .map_err(|e| DriverError::internal(format!("failed to execute nvme disconnect: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") || stderr.contains("No subsystem") {
                warn!(nqn = %nqn, "nvme target was not connected");
                return Ok(());
            }
            return Err(DriverError::unavailable(format!(
                "nvme disconnect failed for {nqn}: {stderr}"
            )));
        }
        Ok(())
    }

    /// Enumerate every connected subsystem under `/sys/class/nvme-subsystem`,
    /// returning those with zero child namespaces.
    pub fn list_orphan_subsystems(&self) -> DriverResult<Vec<String>> {
        let root = Path::new("/sys/class/nvme-subsystem");
        if !root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(root)
            .map_err(|e| DriverError::internal(format!("failed to read {}: {e}", root.display())))?;

        let mut orphans = Vec::new();
        for entry in entries.flatten() {
            let nqn_path = entry.path().join("subsysnqn");
            let Ok(nqn) = fs::read_to_string(&nqn_path) else {
                continue;
            };
            let nqn = nqn.trim().to_string();
            let has_namespace = fs::read_dir(entry.path())
                .map(|dir| dir.flatten().any(|e| is_namespace_device(&e.file_name().to_string_lossy())))
                .unwrap_or(false);
            if !has_namespace {
                debug!(nqn = %nqn, "found orphan nvme subsystem with no namespaces");
                orphans.push(nqn);
            }
        }
        Ok(orphans)
    }
}

fn find_subsystem_path(nqn: &str) -> DriverResult<Option<std::path::PathBuf>> {
    let root = Path::new("/sys/class/nvme-subsystem");
    if !root.exists() {
        return Ok(None);
    }
    let entries = fs::read_dir(root)
        .map_err(|e| DriverError::internal(format!("failed to read {}: {e}", root.display())))?;
    for entry in entries.flatten() {
        let nqn_path = entry.path().join("subsysnqn");
        if let Ok(contents) = fs::read_to_string(&nqn_path)
            && contents.trim() == nqn
        {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn find_namespace_device(subsys_path: &Path) -> DriverResult<Option<String>> {
    let entries = fs::read_dir(subsys_path)
        .map_err(|e| DriverError::internal(format!("failed to read {}: {e}", subsys_path.display())))?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_namespace_device(&name) {
            return Ok(Some(format!("/dev/{name}")));
        }
    }
    Ok(None)
}

/// `nvme0n1` is a namespace device; `nvme0` is just the controller.
fn is_namespace_device(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    let mut chars = rest.chars().peekable();
    if !chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
    }
    if chars.next() != Some('n') {
        return false;
    }
    chars.peek().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_device_detection() {
        assert!(is_namespace_device("nvme0n1"));
        assert!(is_namespace_device("nvme10n15"));
        assert!(!is_namespace_device("nvme0"));
        assert!(!is_namespace_device("sda"));
        assert!(!is_namespace_device(""));
    }

    #[test]
    fn resolve_device_against_missing_sysfs_times_out_quickly() {
        let connector = NvmeConnector::new();
        let result = connector.resolve_device(
            "nqn.2024-06.io.example:pvc-nonexistent",
            Duration::from_millis(50),
        );
        assert!(result.is_err());
    }
}
