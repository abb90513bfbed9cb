//! CSI Node service: stages, publishes, and unpublishes volumes on this
//! host over NVMe/TCP.
//!
//! The NVMe subsystem name is always `nqn_for_volume(nqn_prefix, volume_id)`,
//! so every RPC re-derives it from its own request rather than depending on
//! state left behind by an earlier call -- a crash between Stage and Unstage
//! leaves nothing to reconcile. The one exception is the small staged-mount
//! table kept between Stage and Unstage purely so a later `NodeGetVolumeStats`
//! can recover a stale mount without the orchestrator re-supplying the
//! original connect parameters; losing it (a node-agent restart) just means
//! a stale mount found after that point is reported, not auto-recovered.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use csi_common::ids::nqn_for_volume;
use csi_common::{DriverError, DriverResult};

use crate::csi;
use crate::mount::MountEngine;
use crate::nvme::{NvmeConnectParams, NvmeConnector};
use crate::stale::StaleMountDetector;

const DEFAULT_CTRL_LOSS_TMO: i64 = -1;
const DEFAULT_RECONNECT_DELAY: u32 = 5;
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the stale-mount recoverer needs to redo a stage, keyed by
/// volume id between a successful `NodeStageVolume` and its matching
/// `NodeUnstageVolume`. The NVMe subsystem name itself never needs this --
/// `nqn_for` re-derives it -- but the connect parameters and mount shape
/// came from the orchestrator's original request and can't be.
#[derive(Clone)]
struct StagedMount {
    connect_params: NvmeConnectParams,
    mount_point: String,
    fs_type: String,
    mount_flags: Vec<String>,
    raw_block: bool,
}

pub struct NodeService {
    node_id: String,
    nqn_prefix: String,
    max_volumes_per_node: i64,
    nvme: NvmeConnector,
    mount: MountEngine,
    stale: StaleMountDetector,
    staged: Mutex<HashMap<String, StagedMount>>,
}

impl NodeService {
    pub fn new(node_id: String, nqn_prefix: String, max_volumes_per_node: i64) -> Self {
        Self {
            node_id,
            nqn_prefix,
            max_volumes_per_node,
            nvme: NvmeConnector::new(),
            mount: MountEngine::new(),
            stale: StaleMountDetector::new(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    fn nqn_for(&self, volume_id: &str) -> String {
        nqn_for_volume(&self.nqn_prefix, volume_id)
    }

    fn connect_params(
        &self,
        volume_id: &str,
        publish_context: &std::collections::HashMap<String, String>,
    ) -> Result<NvmeConnectParams, Status> {
        let target_ip = publish_context
            .get("ip")
            .ok_or_else(|| DriverError::invalid_argument("publish_context missing \"ip\""))?
            .clone();
        let target_port: u16 = publish_context
            .get("port")
            .ok_or_else(|| DriverError::invalid_argument("publish_context missing \"port\""))?
            .parse()
            .map_err(|_| DriverError::invalid_argument("publish_context \"port\" is not a valid port number"))?;
        let keep_alive_tmo = publish_context
            .get("keepAliveTmo")
            .and_then(|v| v.parse().ok());

        Ok(NvmeConnectParams {
            target_ip,
            target_port,
            nqn: self.nqn_for(volume_id),
            ctrl_loss_tmo: DEFAULT_CTRL_LOSS_TMO,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            keep_alive_tmo,
        })
    }
}

/// `true` if the capability requests raw block access rather than a
/// filesystem mount.
fn is_block_capability(capability: &csi::VolumeCapability) -> bool {
    matches!(
        capability.access_type,
        Some(csi::volume_capability::AccessType::Block(_))
    )
}

fn mount_capability_fields(capability: &csi::VolumeCapability) -> (String, Vec<String>) {
    match &capability.access_type {
        Some(csi::volume_capability::AccessType::Mount(mount)) => {
            (mount.fs_type.clone(), mount.mount_flags.clone())
        }
        _ => (String::new(), Vec::new()),
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(DriverError::invalid_argument("volume_id is required").into());
        }
        if req.staging_target_path.is_empty() {
            return Err(DriverError::invalid_argument("staging_target_path is required").into());
        }
        let capability = req
            .volume_capability
            .ok_or_else(|| DriverError::invalid_argument("volume_capability is required"))?;

        let params = self.connect_params(&req.volume_id, &req.publish_context)?;
        info!(volume_id = %req.volume_id, nqn = %params.nqn, "staging volume");

        self.nvme.connect(&params).map_err(to_status)?;
        let device = self
            .nvme
            .resolve_device(&params.nqn, DEFAULT_RESOLVE_TIMEOUT)
            .map_err(to_status)?;

        let raw_block = is_block_capability(&capability);
        let (fs_type, mount_flags) = mount_capability_fields(&capability);
        if raw_block {
            self.mount
                .bind_raw_block(&device, &req.staging_target_path)
                .map_err(to_status)?;
        } else {
            self.mount.format(&device, &fs_type).map_err(to_status)?;
            self.mount
                .mount(&device, &req.staging_target_path, &fs_type, &mount_flags)
                .map_err(to_status)?;
        }

        self.staged.lock().unwrap().insert(
            req.volume_id.clone(),
            StagedMount {
                connect_params: params,
                mount_point: req.staging_target_path.clone(),
                fs_type,
                mount_flags,
                raw_block,
            },
        );

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(DriverError::invalid_argument("volume_id is required").into());
        }
        if req.staging_target_path.is_empty() {
            return Err(DriverError::invalid_argument("staging_target_path is required").into());
        }

        let nqn = self.nqn_for(&req.volume_id);
        info!(volume_id = %req.volume_id, nqn = %nqn, "unstaging volume");

        self.mount.unmount(&req.staging_target_path).map_err(to_status)?;
        self.nvme.disconnect(&nqn).map_err(to_status)?;
        self.staged.lock().unwrap().remove(&req.volume_id);

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(DriverError::invalid_argument("volume_id is required").into());
        }
        if req.staging_target_path.is_empty() {
            return Err(DriverError::invalid_argument("staging_target_path is required").into());
        }
        if req.target_path.is_empty() {
            return Err(DriverError::invalid_argument("target_path is required").into());
        }
        let capability = req
            .volume_capability
            .ok_or_else(|| DriverError::invalid_argument("volume_capability is required"))?;

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "publishing volume");

        if is_block_capability(&capability) {
            self.mount
                .bind_raw_block(&req.staging_target_path, &req.target_path)
                .map_err(to_status)?;
        } else {
            self.mount
                .bind_mount_dir(&req.staging_target_path, &req.target_path, req.readonly)
                .map_err(to_status)?;
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(DriverError::invalid_argument("volume_id is required").into());
        }
        if req.target_path.is_empty() {
            return Err(DriverError::invalid_argument("target_path is required").into());
        }

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "unpublishing volume");
        self.mount.unmount(&req.target_path).map_err(to_status)?;

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(DriverError::invalid_argument("volume_id is required").into());
        }
        if req.volume_path.is_empty() {
            return Err(DriverError::invalid_argument("volume_path is required").into());
        }

        let is_stale = self.stale.is_stale(&req.volume_path).map_err(to_status)?;
        if is_stale {
            warn!(volume_id = %req.volume_id, volume_path = %req.volume_path, "stale mount detected, attempting recovery");
            let staged = self.staged.lock().unwrap().get(&req.volume_id).cloned();
            let recovered = match staged {
                Some(staged) => self
                    .stale
                    .recover(
                        &staged.mount_point,
                        &staged.connect_params,
                        &staged.fs_type,
                        &staged.mount_flags,
                        staged.raw_block,
                        &self.nvme,
                        &self.mount,
                        DEFAULT_RESOLVE_TIMEOUT,
                    )
                    .err(),
                None => Some(DriverError::failed_precondition(
                    "stale mount has no staged record to recover from, node agent may have restarted since stage",
                )),
            };

            if let Some(err) = recovered {
                warn!(volume_id = %req.volume_id, volume_path = %req.volume_path, error = %err, "stale mount recovery failed");
                return Ok(Response::new(csi::NodeGetVolumeStatsResponse {
                    usage: vec![],
                    volume_condition: Some(csi::VolumeCondition {
                        abnormal: true,
                        message: format!("mount is stale and recovery failed: {err}"),
                    }),
                }));
            }
            info!(volume_id = %req.volume_id, volume_path = %req.volume_path, "stale mount recovered, reporting healthy");
        }

        let usage = volume_usage(&req.volume_path).map_err(to_status)?;
        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![usage],
            volume_condition: Some(csi::VolumeCondition {
                abnormal: false,
                message: String::new(),
            }),
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(DriverError::invalid_argument("volume_id is required").into());
        }
        let requested_bytes = req
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or(0);
        if requested_bytes <= 0 {
            return Err(DriverError::invalid_argument("capacity_range.required_bytes must be positive").into());
        }

        let nqn = self.nqn_for(&req.volume_id);
        let device = self
            .nvme
            .resolve_device(&nqn, DEFAULT_RESOLVE_TIMEOUT)
            .map_err(to_status)?;

        let fs_type = req
            .volume_capability
            .as_ref()
            .map(mount_capability_fields)
            .map(|(fs_type, _)| fs_type)
            .unwrap_or_default();

        info!(volume_id = %req.volume_id, device = %device, requested_bytes, "expanding volume");
        self.mount
            .resize(&device, &fs_type, requested_bytes as u64)
            .map_err(to_status)?;

        Ok(Response::new(csi::NodeExpandVolumeResponse {
            capacity_bytes: requested_bytes,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type as RpcType;
        use csi::node_service_capability::{Rpc, Type as CapabilityType};

        let capability = |rpc_type: RpcType| csi::NodeServiceCapability {
            r#type: Some(CapabilityType::Rpc(Rpc {
                r#type: rpc_type as i32,
            })),
        };

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![
                capability(RpcType::StageUnstageVolume),
                capability(RpcType::GetVolumeStats),
                capability(RpcType::ExpandVolume),
                capability(RpcType::VolumeCondition),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: None,
        }))
    }
}

fn to_status(err: DriverError) -> Status {
    err.into()
}

/// Disk usage of the filesystem backing `path`, via `df` rather than a raw
/// `statvfs` binding -- consistent with the rest of this module shelling out
/// to system tools instead of linking platform-specific crates.
fn volume_usage(path: &str) -> DriverResult<csi::VolumeUsage> {
    let output = Command::new("df")
        .args(["--output=avail,size,used", "-B1", path])
        .output()
        .map_err(|e| DriverError::internal(format!("failed to execute df: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DriverError::internal(format!("df failed: {stderr}")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let data_line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| DriverError::internal("unexpected df output: missing data line"))?;
    let fields: Vec<&str> = data_line.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(DriverError::internal(format!(
            "unexpected df output: {data_line}"
        )));
    }
    let parse = |s: &str| {
        s.parse::<i64>()
            .map_err(|e| DriverError::internal(format!("unexpected df field {s:?}: {e}")))
    };

    Ok(csi::VolumeUsage {
        available: parse(fields[0])?,
        total: parse(fields[1])?,
        used: parse(fields[2])?,
        unit: csi::volume_usage::Unit::Bytes as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::node_server::Node;
    use std::collections::HashMap;

    fn service() -> NodeService {
        NodeService::new(
            "node-1".to_string(),
            "nqn.2024-06.io.example.csi".to_string(),
            128,
        )
    }

    #[test]
    fn nqn_is_derived_deterministically_from_volume_id() {
        let svc = service();
        assert_eq!(
            svc.nqn_for("pvc-abc"),
            "nqn.2024-06.io.example.csi:pvc-abc"
        );
        assert_eq!(svc.nqn_for("pvc-abc"), svc.nqn_for("pvc-abc"));
    }

    #[test]
    fn connect_params_rejects_missing_ip() {
        let svc = service();
        let mut ctx = HashMap::new();
        ctx.insert("port".to_string(), "4420".to_string());
        assert!(svc.connect_params("pvc-abc", &ctx).is_err());
    }

    #[test]
    fn connect_params_rejects_invalid_port() {
        let svc = service();
        let mut ctx = HashMap::new();
        ctx.insert("ip".to_string(), "10.42.68.1".to_string());
        ctx.insert("port".to_string(), "not-a-port".to_string());
        assert!(svc.connect_params("pvc-abc", &ctx).is_err());
    }

    #[test]
    fn connect_params_reads_ip_and_port() {
        let svc = service();
        let mut ctx = HashMap::new();
        ctx.insert("ip".to_string(), "10.42.68.1".to_string());
        ctx.insert("port".to_string(), "4420".to_string());
        let params = svc.connect_params("pvc-abc", &ctx).unwrap();
        assert_eq!(params.target_ip, "10.42.68.1");
        assert_eq!(params.target_port, 4420);
        assert_eq!(params.nqn, "nqn.2024-06.io.example.csi:pvc-abc");
    }

    #[tokio::test]
    async fn node_stage_volume_rejects_missing_volume_id() {
        let svc = service();
        let result = Node::node_stage_volume(
            &svc,
            Request::new(csi::NodeStageVolumeRequest {
                volume_id: String::new(),
                publish_context: HashMap::new(),
                staging_target_path: "/mnt/x".to_string(),
                volume_capability: None,
                volume_context: HashMap::new(),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn node_get_capabilities_reports_four_rpcs() {
        let svc = service();
        let response = Node::node_get_capabilities(&svc, Request::new(csi::NodeGetCapabilitiesRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().capabilities.len(), 4);
    }

    #[tokio::test]
    async fn node_get_info_reports_configured_node_id() {
        let svc = service();
        let response = Node::node_get_info(&svc, Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap();
        let info = response.into_inner();
        assert_eq!(info.node_id, "node-1");
        assert_eq!(info.max_volumes_per_node, 128);
    }
}
