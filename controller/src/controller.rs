//! CSI Controller service implementation.
//!
//! Every RPC follows the same shape: validate inputs, consult or mutate
//! the attachment manager, invoke the appliance client, map errors through
//! the shared `DriverError` taxonomy, and emit an audit event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use csi_common::ids::{generate_volume_id, nqn_for_volume};
use csi_common::validation::clamp_capacity;
use csi_common::{DriverError, DriverResult};

use crate::appliance::{ApplianceClient, ApplianceSnapshot, ApplianceVolume};
use crate::attachment::{AccessMode, AttachmentManager};
use crate::csi;
use crate::metrics;
use crate::snapshot::SnapshotEngine;

pub struct ControllerService {
    appliance: Arc<ApplianceClient>,
    attachment: Arc<AttachmentManager>,
    snapshots: Arc<SnapshotEngine>,
    nqn_prefix: String,
    storage_ip: String,
    nvme_port: u16,
    base_path: String,
}

impl ControllerService {
    pub fn new(
        appliance: Arc<ApplianceClient>,
        attachment: Arc<AttachmentManager>,
        snapshots: Arc<SnapshotEngine>,
        nqn_prefix: String,
        storage_ip: String,
        nvme_port: u16,
        base_path: String,
    ) -> Self {
        Self {
            appliance,
            attachment,
            snapshots,
            nqn_prefix,
            storage_ip,
            nvme_port,
            base_path,
        }
    }

    fn file_path(&self, id: &str) -> String {
        format!("{}/{id}.img", self.base_path)
    }

    fn nqn_for(&self, volume_id: &str) -> String {
        nqn_for_volume(&self.nqn_prefix, volume_id)
    }

    /// Audit event required by every Controller RPC, carrying the fields
    /// a security audit consumer needs in addition to the `tracing` span
    /// each handler already emits around the call.
    fn audit(operation: &str, volume_id: &str, node_id: &str, outcome: &str, duration: std::time::Duration, error_kind: Option<&str>) {
        info!(
            target: "audit",
            operation,
            volume_id,
            node_id,
            outcome,
            duration_ms = duration.as_millis() as u64,
            error_kind = error_kind.unwrap_or(""),
            "controller audit event"
        );
        metrics::record_operation(operation, error_kind.unwrap_or(outcome), duration.as_secs_f64());
    }

    fn volume_size(capacity_range: Option<&csi::CapacityRange>) -> DriverResult<u64> {
        let requested = capacity_range.map(|r| r.required_bytes).unwrap_or(0);
        clamp_capacity(requested)
    }

    /// Reject RWX filesystem mounts: multi-writer access is only sound on
    /// raw block volumes in this system (non-goal: simultaneous writers on
    /// a shared filesystem).
    fn access_mode_from_capability(cap: &csi::VolumeCapability) -> DriverResult<AccessMode> {
        use csi::volume_capability::access_mode::Mode;
        let mode = cap
            .access_mode
            .as_ref()
            .map(|m| Mode::try_from(m.mode).unwrap_or(Mode::Unknown))
            .unwrap_or(Mode::Unknown);
        let is_multi_writer = matches!(
            mode,
            Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter | Mode::SingleNodeMultiWriter
        );
        let is_block = matches!(cap.access_type, Some(csi::volume_capability::AccessType::Block(_)));

        if is_multi_writer && !is_block {
            return Err(DriverError::invalid_argument(
                "RWX access mode requires volumeMode: Block -- filesystem volumes risk data corruption with multi-node access",
            ));
        }

        Ok(if is_multi_writer {
            AccessMode::MultiWriter
        } else {
            AccessMode::SingleWriter
        })
    }

    fn appliance_volume_to_csi(&self, volume: &ApplianceVolume, content_source: Option<csi::VolumeContentSource>) -> csi::Volume {
        let mut volume_context = HashMap::new();
        volume_context.insert("nqn".to_string(), volume.nqn.clone().unwrap_or_else(|| self.nqn_for(&volume.slot)));
        volume_context.insert("ip".to_string(), self.storage_ip.clone());
        volume_context.insert("port".to_string(), volume.port.unwrap_or(self.nvme_port).to_string());

        csi::Volume {
            capacity_bytes: volume.size_bytes as i64,
            volume_id: volume.slot.clone(),
            volume_context,
            content_source,
            accessible_topology: None,
        }
    }

    async fn snapshot_to_csi(&self, snapshot: &ApplianceSnapshot) -> csi::Snapshot {
        let creation_time = self.snapshots.created_at(&snapshot.slot).await.map(system_time_to_timestamp);
        let source_volume_id = self.snapshots.source_volume_for(&snapshot.slot).await.unwrap_or_default();
        csi::Snapshot {
            size_bytes: snapshot.size_bytes as i64,
            snapshot_id: snapshot.slot.clone(),
            source_volume_id,
            creation_time,
            ready_to_use: true,
        }
    }
}

fn system_time_to_timestamp(t: SystemTime) -> Timestamp {
    let duration = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    Timestamp {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

fn require_nonempty(value: &str, field: &str) -> DriverResult<()> {
    if value.is_empty() {
        return Err(DriverError::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.name, "name")?;
        let timer = Instant::now();

        let size_bytes = Self::volume_size(req.capacity_range.as_ref())?;
        for cap in &req.volume_capabilities {
            Self::access_mode_from_capability(cap)?;
        }

        let result: DriverResult<(ApplianceVolume, Option<csi::VolumeContentSource>)> = async {
            if let Some(csi::VolumeContentSource {
                r#type: Some(csi::volume_content_source::Type::Snapshot(ref snap)),
            }) = req.volume_content_source
            {
                let new_id = generate_volume_id();
                let nqn = self.nqn_for(&new_id);
                let volume = self
                    .snapshots
                    .restore_snapshot(&new_id, &snap.snapshot_id, size_bytes, &nqn, self.nvme_port)
                    .await?;
                Ok((volume, req.volume_content_source.clone()))
            } else {
                let id = generate_volume_id();
                let nqn = self.nqn_for(&id);
                let file_path = self.file_path(&id);
                let volume = self
                    .appliance
                    .create_volume(&id, size_bytes, &file_path, &nqn, self.nvme_port)
                    .await?;
                Ok((volume, None))
            }
        }
        .await;

        match result {
            Ok((volume, content_source)) => {
                Self::audit("CreateVolume", &volume.slot, "", "success", timer.elapsed(), None);
                info!(volume_id = %volume.slot, size_bytes, "volume created");
                Ok(Response::new(csi::CreateVolumeResponse {
                    volume: Some(self.appliance_volume_to_csi(&volume, content_source)),
                }))
            }
            Err(e) => {
                Self::audit("CreateVolume", "", "", "failure", timer.elapsed(), Some(e.kind().as_str()));
                warn!(error = %e, name = %req.name, "CreateVolume failed");
                Err(e.into())
            }
        }
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.volume_id, "volume_id")?;
        let timer = Instant::now();

        let result: DriverResult<()> = async {
            self.appliance.delete_volume(&req.volume_id).await?;
            self.appliance.delete_file(&self.file_path(&req.volume_id)).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                Self::audit("DeleteVolume", &req.volume_id, "", "success", timer.elapsed(), None);
                Ok(Response::new(csi::DeleteVolumeResponse {}))
            }
            Err(e) => {
                Self::audit("DeleteVolume", &req.volume_id, "", "failure", timer.elapsed(), Some(e.kind().as_str()));
                Err(e.into())
            }
        }
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.volume_id, "volume_id")?;
        require_nonempty(&req.node_id, "node_id")?;
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| DriverError::invalid_argument("volume_capability is required"))?;
        let access_mode = Self::access_mode_from_capability(cap)?;
        let timer = Instant::now();

        // Publishes targeting the same virtual machine instance during a
        // live migration are serialized behind a per-VMI lock to avoid
        // dual-attach thrash; the grouping identity rides along as an
        // optional volume_context entry set by the orchestrator's CSI
        // driver integration for virtualization workloads.
        let _vmi_guard = match req.volume_context.get("vmi_id") {
            Some(vmi_id) => Some(self.attachment.lock_vmi(vmi_id).await),
            None => None,
        };

        let result = self.attachment.track(&req.volume_id, &req.node_id, access_mode).await;

        match result {
            Ok(()) => {
                Self::audit("ControllerPublishVolume", &req.volume_id, &req.node_id, "success", timer.elapsed(), None);
                let mut publish_context = HashMap::new();
                publish_context.insert("nqn".to_string(), self.nqn_for(&req.volume_id));
                publish_context.insert("ip".to_string(), self.storage_ip.clone());
                publish_context.insert("port".to_string(), self.nvme_port.to_string());
                for key in ["ctrl_loss_tmo", "reconnect_delay", "keep_alive_tmo"] {
                    if let Some(value) = req.volume_context.get(key) {
                        publish_context.insert(key.to_string(), value.clone());
                    }
                }
                Ok(Response::new(csi::ControllerPublishVolumeResponse { publish_context }))
            }
            Err(e) => {
                Self::audit(
                    "ControllerPublishVolume",
                    &req.volume_id,
                    &req.node_id,
                    "failure",
                    timer.elapsed(),
                    Some(e.kind().as_str()),
                );
                Err(e.into())
            }
        }
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.volume_id, "volume_id")?;
        let timer = Instant::now();

        match self.attachment.untrack(&req.volume_id, &req.node_id).await {
            Ok(()) => {
                Self::audit("ControllerUnpublishVolume", &req.volume_id, &req.node_id, "success", timer.elapsed(), None);
                Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
            }
            Err(e) => {
                Self::audit(
                    "ControllerUnpublishVolume",
                    &req.volume_id,
                    &req.node_id,
                    "failure",
                    timer.elapsed(),
                    Some(e.kind().as_str()),
                );
                Err(e.into())
            }
        }
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.volume_id, "volume_id")?;

        let result: DriverResult<()> = async {
            self.appliance
                .get_volume(&req.volume_id)
                .await?
                .ok_or_else(|| DriverError::not_found(format!("volume {} does not exist", req.volume_id)))?;
            Ok(())
        }
        .await;
        result?;

        for cap in &req.volume_capabilities {
            if let Err(err) = Self::access_mode_from_capability(cap) {
                return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: err.message,
                }));
            }
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        let mut volumes = self.appliance.list_volumes("pvc-").await.map_err(Into::<Status>::into)?;
        volumes.sort_by(|a, b| a.slot.cmp(&b.slot));

        let start: usize = req.starting_token.parse().unwrap_or(0);
        let max_entries = if req.max_entries > 0 { req.max_entries as usize } else { volumes.len() };

        let mut entries = Vec::new();
        for volume in volumes.iter().skip(start).take(max_entries) {
            let published_node_ids = self
                .attachment
                .get(&volume.slot)
                .await
                .map(|state| state.node_ids().into_iter().map(str::to_string).collect())
                .unwrap_or_default();
            entries.push(csi::list_volumes_response::Entry {
                volume: Some(self.appliance_volume_to_csi(volume, None)),
                status: Some(csi::list_volumes_response::VolumeStatus { published_node_ids }),
            });
        }

        let next_token = if start + entries.len() < volumes.len() {
            (start + entries.len()).to_string()
        } else {
            String::new()
        };

        Ok(Response::new(csi::ListVolumesResponse { entries, next_token }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        // The appliance's CLI surface has no total/available capacity
        // query (only per-disk size); reporting an optimistic ceiling
        // rather than refusing the call lets the orchestrator's scheduler
        // keep working, at the cost of not actually bounding placement.
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: i64::MAX,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::{rpc::Type as RpcType, Type as CapabilityType, RPC};

        let rpc_types = [
            RpcType::CreateDeleteVolume,
            RpcType::PublishUnpublishVolume,
            RpcType::ListVolumes,
            RpcType::GetCapacity,
            RpcType::CreateDeleteSnapshot,
            RpcType::ListSnapshots,
            RpcType::ExpandVolume,
        ];

        let capabilities = rpc_types
            .into_iter()
            .map(|t| csi::ControllerServiceCapability {
                r#type: Some(CapabilityType::Rpc(RPC { r#type: t as i32 })),
            })
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse { capabilities }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.source_volume_id, "source_volume_id")?;
        require_nonempty(&req.name, "name")?;
        let timer = Instant::now();

        match self.snapshots.create_snapshot(&req.name, &req.source_volume_id).await {
            Ok(snapshot) => {
                Self::audit("CreateSnapshot", &req.source_volume_id, "", "success", timer.elapsed(), None);
                Ok(Response::new(csi::CreateSnapshotResponse {
                    snapshot: Some(self.snapshot_to_csi(&snapshot).await),
                }))
            }
            Err(e) => {
                Self::audit(
                    "CreateSnapshot",
                    &req.source_volume_id,
                    "",
                    "failure",
                    timer.elapsed(),
                    Some(e.kind().as_str()),
                );
                Err(e.into())
            }
        }
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.snapshot_id, "snapshot_id")?;
        let timer = Instant::now();

        match self.snapshots.delete_snapshot(&req.snapshot_id).await {
            Ok(()) => {
                Self::audit("DeleteSnapshot", "", "", "success", timer.elapsed(), None);
                Ok(Response::new(csi::DeleteSnapshotResponse {}))
            }
            Err(e) if e.kind() == csi_common::ErrorKind::NotFound => {
                Self::audit("DeleteSnapshot", &req.snapshot_id, "", "success", timer.elapsed(), None);
                Ok(Response::new(csi::DeleteSnapshotResponse {}))
            }
            Err(e) => {
                Self::audit("DeleteSnapshot", &req.snapshot_id, "", "failure", timer.elapsed(), Some(e.kind().as_str()));
                Err(e.into())
            }
        }
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();

        if !req.snapshot_id.is_empty() {
            let snapshot = self.snapshots.get_snapshot(&req.snapshot_id).await.map_err(Into::<Status>::into)?;
            let entries = match snapshot {
                Some(s) => vec![csi::list_snapshots_response::Entry {
                    snapshot: Some(self.snapshot_to_csi(&s).await),
                }],
                None => vec![],
            };
            return Ok(Response::new(csi::ListSnapshotsResponse { entries, next_token: String::new() }));
        }

        let filter = (!req.source_volume_id.is_empty()).then_some(req.source_volume_id.as_str());
        let mut snapshots = self.snapshots.list_snapshots(filter).await.map_err(Into::<Status>::into)?;
        snapshots.sort_by(|a, b| a.slot.cmp(&b.slot));

        let start: usize = req.starting_token.parse().unwrap_or(0);
        let max_entries = if req.max_entries > 0 { req.max_entries as usize } else { snapshots.len() };

        let mut entries = Vec::with_capacity(max_entries.min(snapshots.len()));
        for snapshot in snapshots.iter().skip(start).take(max_entries) {
            entries.push(csi::list_snapshots_response::Entry {
                snapshot: Some(self.snapshot_to_csi(snapshot).await),
            });
        }

        let next_token = if start + entries.len() < snapshots.len() {
            (start + entries.len()).to_string()
        } else {
            String::new()
        };

        Ok(Response::new(csi::ListSnapshotsResponse { entries, next_token }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        require_nonempty(&req.volume_id, "volume_id")?;
        let timer = Instant::now();

        let new_size = Self::volume_size(req.capacity_range.as_ref())?;

        let result: DriverResult<u64> = async {
            self.appliance.resize_volume(&req.volume_id, new_size).await?;
            Ok(new_size)
        }
        .await;

        match result {
            Ok(size) => {
                Self::audit("ControllerExpandVolume", &req.volume_id, "", "success", timer.elapsed(), None);
                Ok(Response::new(csi::ControllerExpandVolumeResponse {
                    capacity_bytes: size as i64,
                    node_expansion_required: true,
                }))
            }
            Err(e) => {
                Self::audit(
                    "ControllerExpandVolume",
                    &req.volume_id,
                    "",
                    "failure",
                    timer.elapsed(),
                    Some(e.kind().as_str()),
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::ssh::SshConfig;
    use crate::appliance::SshSessionManager;
    use crate::attachment::InMemoryClusterRecordStore;
    use std::time::Duration;

    fn service() -> ControllerService {
        let ssh = SshSessionManager::new(SshConfig {
            host: "appliance.invalid".to_string(),
            port: 22,
            username: "csi".to_string(),
            private_key_path: "/dev/null".into(),
            pinned_host_key_sha256: String::new(),
            liveness_probe_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
            backoff_cap: Duration::from_secs(60),
            backoff_jitter_ratio: 0.1,
        });
        let appliance = Arc::new(ApplianceClient::new(ssh));
        let attachment = Arc::new(AttachmentManager::new(
            "csi.example.io".to_string(),
            Duration::from_secs(120),
            Arc::new(InMemoryClusterRecordStore::new()),
        ));
        let snapshots = Arc::new(SnapshotEngine::new(appliance.clone(), "/mnt/csi".to_string()));
        ControllerService::new(
            appliance,
            attachment,
            snapshots,
            "nqn.2024-06.io.example.csi".to_string(),
            "10.42.68.1".to_string(),
            4420,
            "/mnt/csi".to_string(),
        )
    }

    #[test]
    fn volume_size_clamps_to_minimum() {
        assert_eq!(ControllerService::volume_size(None).unwrap(), 1 << 30);
    }

    #[test]
    fn volume_size_honors_required_bytes() {
        let range = csi::CapacityRange {
            required_bytes: 5 * (1i64 << 30),
            limit_bytes: 0,
        };
        assert_eq!(ControllerService::volume_size(Some(&range)).unwrap(), 5 * (1u64 << 30));
    }

    #[test]
    fn volume_size_rejects_above_maximum() {
        let range = csi::CapacityRange {
            required_bytes: 17 * (1i64 << 40),
            limit_bytes: 0,
        };
        let err = ControllerService::volume_size(Some(&range)).unwrap_err();
        assert_eq!(err.kind(), csi_common::ErrorKind::OutOfRange);
    }

    #[test]
    fn access_mode_rejects_multi_writer_mount() {
        let cap = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
            })),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
            }),
        };
        assert!(ControllerService::access_mode_from_capability(&cap).is_err());
    }

    #[test]
    fn access_mode_allows_multi_writer_block() {
        let cap = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(csi::volume_capability::BlockVolume {})),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
            }),
        };
        assert_eq!(
            ControllerService::access_mode_from_capability(&cap).unwrap(),
            AccessMode::MultiWriter
        );
    }

    #[test]
    fn access_mode_defaults_single_writer_for_single_node_mount() {
        let cap = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
            })),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        };
        assert_eq!(
            ControllerService::access_mode_from_capability(&cap).unwrap(),
            AccessMode::SingleWriter
        );
    }

    #[tokio::test]
    async fn controller_publish_volume_requires_capability() {
        use csi::controller_server::Controller;
        let svc = service();
        let req = Request::new(csi::ControllerPublishVolumeRequest {
            volume_id: "pvc-abc".to_string(),
            node_id: "node-1".to_string(),
            volume_capability: None,
            readonly: false,
            volume_context: HashMap::new(),
        });
        let err = svc.controller_publish_volume(req).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_volume_requires_volume_id() {
        use csi::controller_server::Controller;
        let svc = service();
        let err = svc
            .delete_volume(Request::new(csi::DeleteVolumeRequest { volume_id: String::new() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
