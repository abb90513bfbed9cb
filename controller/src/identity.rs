//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to the
//! orchestrator. Shared in shape with the node agent's identity service,
//! but kept as a separate impl per binary rather than a shared crate since
//! each plugin advertises different service capabilities.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tonic::{Request, Response, Status};

use crate::csi;

pub use csi_common::DRIVER_NAME;
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared readiness state for the CSI driver.
///
/// Flipped to `true` only once attachment-state rebuild from cluster
/// records has completed; the gRPC server itself starts accepting
/// connections before that point, so Probe is how the orchestrator learns
/// the controller isn't ready yet.
#[derive(Debug)]
pub struct ReadinessState {
    ready: AtomicBool,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IdentityService {
    readiness: Arc<ReadinessState>,
}

impl IdentityService {
    pub fn new(readiness: Arc<ReadinessState>) -> Self {
        Self { readiness }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            },
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                    csi::plugin_capability::VolumeExpansion {
                        r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse {
            ready: Some(self.readiness.is_ready()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;

    #[tokio::test]
    async fn get_plugin_info_reports_name_and_version() {
        let service = IdentityService::new(Arc::new(ReadinessState::new()));
        let response = Identity::get_plugin_info(&service, Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap();
        let info = response.into_inner();
        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn get_plugin_capabilities_reports_controller_and_expansion() {
        let service = IdentityService::new(Arc::new(ReadinessState::new()));
        let response = Identity::get_plugin_capabilities(
            &service,
            Request::new(csi::GetPluginCapabilitiesRequest {}),
        )
        .await
        .unwrap();
        assert_eq!(response.into_inner().capabilities.len(), 2);
    }

    #[tokio::test]
    async fn probe_reflects_readiness_state() {
        let readiness = Arc::new(ReadinessState::new());
        let service = IdentityService::new(readiness.clone());

        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(false));

        readiness.set_ready(true);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }
}
