//! Prometheus metrics for the node agent.
//!
//! Tracks NVMe connect/disconnect outcomes, mount-engine operations, and
//! the two self-healing behaviors that make this agent more than a thin
//! wrapper around `nvme`/`mount`: stale-mount recovery and boot-time
//! orphan-subsystem cleanup.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: NVMe/TCP operations (connect/disconnect) by result
    pub const NVME_OPERATIONS_TOTAL: &str = "node_agent_nvme_operations_total";
    /// Counter: mount-engine operations (format/mount/unmount/resize) by result
    pub const MOUNT_OPERATIONS_TOTAL: &str = "node_agent_mount_operations_total";
    /// Histogram: duration of a staged operation in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "node_agent_operation_duration_seconds";
    /// Gauge: volumes currently staged on this node
    pub const STAGED_VOLUMES: &str = "node_agent_staged_volumes";
    /// Counter: stale mounts detected and recovered
    pub const STALE_MOUNT_RECOVERIES_TOTAL: &str = "node_agent_stale_mount_recoveries_total";
    /// Counter: orphan nvme subsystems cleaned up at startup
    pub const ORPHAN_SUBSYSTEMS_CLEANED_TOTAL: &str = "node_agent_orphan_subsystems_cleaned_total";
}

/// Initialize the Prometheus metrics exporter. Starts an HTTP server on
/// `addr` serving metrics at `/metrics`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record an NVMe operation (e.g. "connect", "disconnect", "resolve") and its result.
pub fn record_nvme_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::NVME_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a mount-engine operation (e.g. "format", "mount", "unmount", "resize") and its result.
pub fn record_mount_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::MOUNT_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Set the number of volumes currently staged on this node.
pub fn set_staged_volumes(count: usize) {
    gauge!(names::STAGED_VOLUMES).set(count as f64);
}

/// Record a successful stale-mount recovery.
pub fn record_stale_mount_recovery() {
    counter!(names::STALE_MOUNT_RECOVERIES_TOTAL).increment(1);
}

/// Record an orphan nvme subsystem cleaned up during the boot-time sweep.
pub fn record_orphan_subsystem_cleaned() {
    counter!(names::ORPHAN_SUBSYSTEMS_CLEANED_TOTAL).increment(1);
}

/// Helper for timing an operation and recording it as an NVMe or mount
/// metric depending on which `record` closure the caller supplies.
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn success_nvme(self) {
        record_nvme_operation(&self.operation, "success", self.start.elapsed().as_secs_f64());
    }

    pub fn failure_nvme(self, error_code: &str) {
        record_nvme_operation(&self.operation, error_code, self.start.elapsed().as_secs_f64());
    }

    pub fn success_mount(self) {
        record_mount_operation(&self.operation, "success", self.start.elapsed().as_secs_f64());
    }

    pub fn failure_mount(self, error_code: &str) {
        record_mount_operation(&self.operation, error_code, self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_timer_does_not_panic_without_init() {
        let timer = OperationTimer::new("connect");
        std::thread::sleep(std::time::Duration::from_millis(5));
        drop(timer);
    }
}
