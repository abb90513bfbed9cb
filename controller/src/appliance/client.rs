//! Typed client for the appliance's disk/file CLI surface.
//!
//! This is the single point where appliance error text is classified into
//! the shared error taxonomy -- everything above this layer treats a
//! [`DriverError`]'s `kind()` as authoritative and never re-inspects the
//! message to reclassify it.

use std::sync::Arc;

use tracing::instrument;

use csi_common::error::ErrorKind;
use csi_common::validation::reject_shell_metacharacters;
use csi_common::{DriverError, DriverResult};

use super::parser::{extract_destination_slot, parse_blocks};
use super::ssh::SshSessionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceVolume {
    pub slot: String,
    pub file_path: String,
    pub size_bytes: u64,
    pub nqn: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceSnapshot {
    pub slot: String,
    pub file_path: String,
    pub size_bytes: u64,
}

pub struct ApplianceClient {
    ssh: Arc<SshSessionManager>,
}

impl ApplianceClient {
    pub fn new(ssh: Arc<SshSessionManager>) -> Self {
        Self { ssh }
    }

    fn check_cli_safe(value: &str) -> DriverResult<()> {
        reject_shell_metacharacters(value)
    }

    async fn run(&self, command: &str) -> DriverResult<String> {
        self.ssh
            .run_command(command)
            .await
            .map_err(classify_appliance_error)
    }

    #[instrument(skip(self))]
    pub async fn create_volume(
        &self,
        volume_id: &str,
        size_bytes: u64,
        file_path: &str,
        nqn: &str,
        port: u16,
    ) -> DriverResult<ApplianceVolume> {
        Self::check_cli_safe(volume_id)?;
        Self::check_cli_safe(file_path)?;
        Self::check_cli_safe(nqn)?;

        let command = format!(
            "/disk add type=file file-path={file_path} file-size={size_bytes} \
             nvme-tcp-export=yes nvme-tcp-server-port={port} nvme-tcp-server-nqn={nqn} slot={volume_id}"
        );
        self.run(&command).await?;

        Ok(ApplianceVolume {
            slot: volume_id.to_string(),
            file_path: file_path.to_string(),
            size_bytes,
            nqn: Some(nqn.to_string()),
            port: Some(port),
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_volume(&self, volume_id: &str) -> DriverResult<()> {
        Self::check_cli_safe(volume_id)?;
        let command = format!("/disk remove [find slot={volume_id}]");
        match self.run(&command).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_file(&self, file_path: &str) -> DriverResult<()> {
        Self::check_cli_safe(file_path)?;
        let command = format!("/file remove [find name=\"{file_path}\"]");
        match self.run(&command).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// List backing-file paths under `path_prefix`, for the orphan
    /// reconciler's file-without-a-disk-entry sweep.
    #[instrument(skip(self))]
    pub async fn list_files(&self, path_prefix: &str) -> DriverResult<Vec<String>> {
        Self::check_cli_safe(path_prefix)?;
        let command = format!("/file print detail where name~\"{path_prefix}\"");
        let output = self.run(&command).await?;
        Ok(parse_blocks(&output)
            .into_iter()
            .filter_map(|record| record.get("name").cloned())
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn resize_volume(&self, volume_id: &str, new_size_bytes: u64) -> DriverResult<()> {
        Self::check_cli_safe(volume_id)?;
        let command = format!("/disk resize [find slot={volume_id}] file-size={new_size_bytes}");
        self.run(&command).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_volume(&self, volume_id: &str) -> DriverResult<Option<ApplianceVolume>> {
        Self::check_cli_safe(volume_id)?;
        let command = format!("/disk print detail where slot={volume_id}");
        let output = self.run(&command).await?;
        Ok(parse_blocks(&output).into_iter().next().map(record_to_volume))
    }

    #[instrument(skip(self))]
    pub async fn list_volumes(&self, slot_prefix: &str) -> DriverResult<Vec<ApplianceVolume>> {
        Self::check_cli_safe(slot_prefix)?;
        let command = format!("/disk print detail where slot~\"{slot_prefix}\"");
        let output = self.run(&command).await?;
        Ok(parse_blocks(&output).into_iter().map(record_to_volume).collect())
    }

    /// Create a CoW clone of `source_volume_id` (or an existing snapshot
    /// slot, when restoring) at `snapshot_id`, with no NVMe export.
    #[instrument(skip(self))]
    pub async fn create_snapshot(
        &self,
        snapshot_id: &str,
        source_volume_id: &str,
        file_path: &str,
    ) -> DriverResult<ApplianceSnapshot> {
        Self::check_cli_safe(snapshot_id)?;
        Self::check_cli_safe(source_volume_id)?;
        Self::check_cli_safe(file_path)?;

        let command = format!(
            "/disk add type=file copy-from=[find slot={source_volume_id}] file-path={file_path} slot={snapshot_id}"
        );
        debug_assert_eq!(
            extract_destination_slot(&command).as_deref(),
            Some(snapshot_id),
            "destination slot extraction must agree with the slot we sent"
        );
        self.run(&command).await?;

        let volume = self.get_volume(snapshot_id).await?.ok_or_else(|| {
            DriverError::internal(format!(
                "appliance reported success creating snapshot {snapshot_id} but it is not visible"
            ))
        })?;
        Ok(ApplianceSnapshot {
            slot: volume.slot,
            file_path: volume.file_path,
            size_bytes: volume.size_bytes,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> DriverResult<()> {
        self.delete_volume(snapshot_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_snapshot(&self, snapshot_id: &str) -> DriverResult<Option<ApplianceSnapshot>> {
        Ok(self.get_volume(snapshot_id).await?.map(|v| ApplianceSnapshot {
            slot: v.slot,
            file_path: v.file_path,
            size_bytes: v.size_bytes,
        }))
    }

    #[instrument(skip(self))]
    pub async fn list_snapshots(&self, slot_prefix: &str) -> DriverResult<Vec<ApplianceSnapshot>> {
        Ok(self
            .list_volumes(slot_prefix)
            .await?
            .into_iter()
            .map(|v| ApplianceSnapshot {
                slot: v.slot,
                file_path: v.file_path,
                size_bytes: v.size_bytes,
            })
            .collect())
    }

    /// Restore a volume from a snapshot slot, re-exporting it over NVMe/TCP.
    #[instrument(skip(self))]
    pub async fn restore_snapshot(
        &self,
        new_volume_id: &str,
        snapshot_id: &str,
        size_bytes: u64,
        file_path: &str,
        nqn: &str,
        port: u16,
    ) -> DriverResult<ApplianceVolume> {
        Self::check_cli_safe(new_volume_id)?;
        Self::check_cli_safe(snapshot_id)?;
        Self::check_cli_safe(file_path)?;
        Self::check_cli_safe(nqn)?;

        let command = format!(
            "/disk add type=file copy-from=[find slot={snapshot_id}] file-path={file_path} \
             file-size={size_bytes} slot={new_volume_id} nvme-tcp-export=yes \
             nvme-tcp-server-port={port} nvme-tcp-server-nqn={nqn}"
        );
        self.run(&command).await?;

        self.get_volume(new_volume_id).await?.ok_or_else(|| {
            DriverError::internal(format!(
                "appliance reported success restoring {new_volume_id} but it is not visible"
            ))
        })
    }
}

fn record_to_volume(record: std::collections::HashMap<String, String>) -> ApplianceVolume {
    let size_bytes = record
        .get("file-size")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let port = record
        .get("nvme-tcp-server-port")
        .and_then(|s| s.parse::<u16>().ok());
    ApplianceVolume {
        slot: record.get("slot").cloned().unwrap_or_default(),
        file_path: record.get("file-path").cloned().unwrap_or_default(),
        size_bytes,
        nqn: record.get("nvme-tcp-server-nqn").cloned(),
        port,
    }
}

/// The single point where raw appliance error text becomes a classified
/// [`DriverError`]. Errors that already carry a non-Internal kind (e.g.
/// Unavailable from the SSH transport) pass through unchanged.
fn classify_appliance_error(err: DriverError) -> DriverError {
    if err.kind() != ErrorKind::Internal {
        return err;
    }
    let lower = err.message.to_lowercase();
    if lower.contains("already exists") || lower.contains("already have") {
        DriverError::already_exists(err.message)
    } else if lower.contains("not found") || lower.contains("no such") {
        DriverError::not_found(err.message)
    } else if lower.contains("no space") || lower.contains("not enough free space") {
        DriverError::resource_exhausted(err.message)
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_already_exists() {
        let err = classify_appliance_error(DriverError::internal(
            "appliance command exited 1: failure: disk already exists",
        ));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn classify_maps_not_found() {
        let err = classify_appliance_error(DriverError::internal(
            "appliance command exited 1: failure: no such item",
        ));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn classify_maps_resource_exhausted() {
        let err = classify_appliance_error(DriverError::internal(
            "appliance command exited 1: failure: not enough free space",
        ));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn classify_leaves_non_internal_kinds_untouched() {
        let err = classify_appliance_error(DriverError::unavailable("ssh handshake failed"));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn classify_defaults_unmatched_internal_errors_to_internal() {
        let err = classify_appliance_error(DriverError::internal("some unexpected failure"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn record_to_volume_parses_known_fields() {
        let mut record = std::collections::HashMap::new();
        record.insert("slot".to_string(), "pvc-abc".to_string());
        record.insert("file-path".to_string(), "/vol/pvc-abc.img".to_string());
        record.insert("file-size".to_string(), "1073741824".to_string());
        record.insert("nvme-tcp-server-port".to_string(), "4420".to_string());
        record.insert(
            "nvme-tcp-server-nqn".to_string(),
            "nqn.2024-06.io.example:pvc-abc".to_string(),
        );

        let volume = record_to_volume(record);
        assert_eq!(volume.slot, "pvc-abc");
        assert_eq!(volume.size_bytes, 1073741824);
        assert_eq!(volume.port, Some(4420));
    }
}
