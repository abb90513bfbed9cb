//! Prometheus metrics for the CSI controller.
//!
//! Covers CSI RPC outcomes, the appliance SSH session's connectivity and
//! circuit-breaker state, the attachment manager's live dual-attach
//! windows, and the orphan reconciler's sweep results.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Number of retried operations
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
    /// Gauge: appliance SSH session status (1 = connected, 0 = disconnected)
    pub const APPLIANCE_CONNECTED: &str = "controller_appliance_connected";
    /// Counter: appliance SSH connection attempts
    pub const APPLIANCE_CONNECTION_ATTEMPTS: &str = "controller_appliance_connection_attempts_total";
    /// Gauge: circuit breaker open (1) vs not open (0)
    pub const CIRCUIT_BREAKER_OPEN: &str = "controller_circuit_breaker_open";
    /// Counter: circuit breaker state transitions, labeled by the state entered
    pub const CIRCUIT_BREAKER_TRANSITIONS_TOTAL: &str = "controller_circuit_breaker_transitions_total";
    /// Gauge: volumes currently tracked as attached to at least one node
    pub const ATTACHMENTS_ACTIVE: &str = "controller_attachments_active";
    /// Gauge: volumes currently inside a dual-attach migration window
    pub const DUAL_ATTACH_WINDOWS_ACTIVE: &str = "controller_dual_attach_windows_active";
    /// Counter: orphan candidates found by the reconciler, labeled by kind (disk/file)
    pub const RECONCILER_ORPHANS_FOUND_TOTAL: &str = "controller_reconciler_orphans_found_total";
    /// Counter: orphans actually deleted by the reconciler, labeled by kind (disk/file)
    pub const RECONCILER_ORPHANS_DELETED_TOTAL: &str = "controller_reconciler_orphans_deleted_total";
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

/// Record a CSI operation with its result.
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record the appliance SSH session's connectivity.
pub fn set_appliance_connected(connected: bool) {
    gauge!(names::APPLIANCE_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

/// Record an appliance SSH connection attempt.
pub fn record_appliance_connection_attempt(success: bool) {
    counter!(names::APPLIANCE_CONNECTION_ATTEMPTS, "success" => success.to_string()).increment(1);
}

/// Record the circuit breaker entering `state`.
pub fn record_circuit_breaker_transition(state: &str) {
    counter!(names::CIRCUIT_BREAKER_TRANSITIONS_TOTAL, "state" => state.to_string()).increment(1);
    gauge!(names::CIRCUIT_BREAKER_OPEN).set(if state == "open" { 1.0 } else { 0.0 });
}

/// Set the number of volumes currently tracked as attached.
pub fn set_active_attachments(count: usize) {
    gauge!(names::ATTACHMENTS_ACTIVE).set(count as f64);
}

/// Set the number of volumes currently inside a dual-attach migration window.
pub fn set_dual_attach_windows(count: usize) {
    gauge!(names::DUAL_ATTACH_WINDOWS_ACTIVE).set(count as f64);
}

/// Record orphan candidates the reconciler found this sweep, by kind
/// ("disk" or "file").
pub fn record_reconciler_orphans_found(kind: &str, count: usize) {
    counter!(names::RECONCILER_ORPHANS_FOUND_TOTAL, "kind" => kind.to_string()).increment(count as u64);
}

/// Record orphans the reconciler actually deleted this sweep, by kind.
pub fn record_reconciler_orphans_deleted(kind: &str, count: usize) {
    counter!(names::RECONCILER_ORPHANS_DELETED_TOTAL, "kind" => kind.to_string()).increment(count as u64);
}

/// Helper for timing operations.
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}
