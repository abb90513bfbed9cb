//! CSI Identity service for the node agent.
//!
//! A separate copy from the controller's (same driver name and version, but
//! a different set of plugin capabilities) -- each CSI plugin binary
//! advertises its own capability set.

use tonic::{Request, Response, Status};

use crate::csi;

pub use csi_common::DRIVER_NAME;
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The node agent has no rebuild phase to gate on; it is ready as soon as
/// the boot-time orphan sweep (§4.5) has run.
pub struct IdentityService {
    ready: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl IdentityService {
    pub fn new(ready: std::sync::Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self { ready }
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
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: vec![],
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse {
            ready: Some(self.ready.load(std::sync::atomic::Ordering::SeqCst)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test]
    async fn reports_name_and_version() {
        let service = IdentityService::new(Arc::new(AtomicBool::new(false)));
        let response = Identity::get_plugin_info(&service, Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap();
        let info = response.into_inner();
        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn probe_reflects_ready_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let service = IdentityService::new(ready.clone());
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(false));

        ready.store(true, std::sync::atomic::Ordering::SeqCst);
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }
}
