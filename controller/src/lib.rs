//! Controller plugin library.
//!
//! Implements the CSI Identity and Controller services backed by an
//! appliance reachable over SSH: volume and snapshot lifecycle, attachment
//! tracking across the dual-attach migration window, and a periodic orphan
//! reconciler.

/// CSI proto generated types.
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod appliance;
pub mod attachment;
pub mod config;
pub mod controller;
pub mod identity;
pub mod metrics;
pub mod reconciler;
pub mod snapshot;

pub use attachment::AttachmentManager;
pub use controller::ControllerService;
pub use identity::IdentityService;
