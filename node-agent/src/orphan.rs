//! Boot-time orphan cleanup: NVMe subsystems left connected with no
//! namespaces from a previous node-agent crash or an aborted unstage.

use tracing::{info, warn};

use csi_common::DriverResult;

use crate::metrics;
use crate::nvme::NvmeConnector;

/// Enumerate connected subsystems and disconnect any with zero namespaces.
/// Returns the NQNs that were cleaned up.
pub fn sweep(connector: &NvmeConnector) -> DriverResult<Vec<String>> {
    let orphans = connector.list_orphan_subsystems()?;
    if orphans.is_empty() {
        info!("no orphan nvme subsystems found at startup");
        return Ok(orphans);
    }

    let mut cleaned = Vec::with_capacity(orphans.len());
    for nqn in orphans {
        match connector.disconnect(&nqn) {
            Ok(()) => {
                info!(nqn = %nqn, "disconnected orphan nvme subsystem at startup");
                metrics::record_orphan_subsystem_cleaned();
                cleaned.push(nqn);
            }
            Err(e) => {
                warn!(nqn = %nqn, error = %e, "failed to disconnect orphan nvme subsystem");
            }
        }
    }
    Ok(cleaned)
}
