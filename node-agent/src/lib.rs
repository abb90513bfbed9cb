pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod nvme;
pub mod orphan;
pub mod stale;

pub use identity::IdentityService;
pub use mount::MountEngine;
pub use node::NodeService;
pub use nvme::NvmeConnector;
pub use stale::StaleMountDetector;
