//! Orphan reconciler: periodic sweep cross-referencing appliance disk
//! entries and backing files against the cluster's own volume records.
//!
//! The sweep itself is stateless -- each run re-derives its orphan
//! candidates from the appliance and the cluster record store, nothing is
//! persisted to disk. The grace period is tracked in an in-memory map
//! keyed by slot/path that resets on restart; losing it only delays a
//! deletion by one more grace period, it never causes a premature one, so
//! restarting the controller mid-sweep is always safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use csi_common::DriverResult;

use crate::appliance::ApplianceClient;
use crate::metrics;

/// Boundary to the cluster's own volume bookkeeping (e.g. the
/// orchestrator's PersistentVolume objects). Distinct from
/// [`crate::attachment::ClusterRecordStore`], which tracks attachment
/// intent rather than volume existence; no concrete client for either
/// exists in this workspace's dependency stack, so both are modeled as
/// thin synchronous trait boundaries.
pub trait ClusterVolumeStore: Send + Sync {
    fn volume_exists(&self, volume_id: &str) -> DriverResult<bool>;
}

#[derive(Default)]
pub struct InMemoryClusterVolumeStore {
    volumes: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl InMemoryClusterVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, volume_id: impl Into<String>) {
        self.volumes.lock().unwrap().insert(volume_id.into());
    }
}

impl ClusterVolumeStore for InMemoryClusterVolumeStore {
    fn volume_exists(&self, volume_id: &str) -> DriverResult<bool> {
        Ok(self.volumes.lock().unwrap().contains(volume_id))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphaned_disks_found: Vec<String>,
    pub orphaned_disks_deleted: Vec<String>,
    pub orphaned_files_found: Vec<String>,
    pub orphaned_files_deleted: Vec<String>,
    pub dry_run: bool,
}

pub struct OrphanReconciler {
    appliance: Arc<ApplianceClient>,
    volumes: Arc<dyn ClusterVolumeStore>,
    slot_prefix: String,
    base_path: String,
    grace: Duration,
    dry_run: bool,
    first_seen: std::sync::Mutex<HashMap<String, Instant>>,
}

impl OrphanReconciler {
    pub fn new(
        appliance: Arc<ApplianceClient>,
        volumes: Arc<dyn ClusterVolumeStore>,
        slot_prefix: String,
        base_path: String,
        grace: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            appliance,
            volumes,
            slot_prefix,
            base_path,
            grace,
            dry_run,
            first_seen: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `key` has been an orphan candidate for at least
    /// the grace period, tracking its first-seen time if new.
    fn past_grace(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.first_seen.lock().unwrap();
        let first = *seen.entry(key.to_string()).or_insert(now);
        now.duration_since(first) >= self.grace
    }

    fn clear_seen(&self, key: &str) {
        self.first_seen.lock().unwrap().remove(key);
    }

    /// Run a single sweep. Safe to call repeatedly and concurrently with
    /// CSI traffic: a volume created between the appliance listing and the
    /// cluster-record check is simply not yet past its grace period.
    pub async fn run_once(&self) -> DriverResult<ReconcileReport> {
        let mut report = ReconcileReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        let disks = self.appliance.list_volumes(&self.slot_prefix).await?;
        let mut live_file_paths = std::collections::HashSet::new();
        for disk in &disks {
            live_file_paths.insert(disk.file_path.clone());
            if self.volumes.volume_exists(&disk.slot)? {
                self.clear_seen(&disk.slot);
                continue;
            }
            report.orphaned_disks_found.push(disk.slot.clone());
            if !self.past_grace(&disk.slot) {
                continue;
            }
            if self.dry_run {
                info!(slot = %disk.slot, "dry-run: would delete orphaned disk entry");
            } else {
                warn!(slot = %disk.slot, "deleting orphaned disk entry past grace period");
                self.appliance.delete_volume(&disk.slot).await?;
                self.clear_seen(&disk.slot);
                report.orphaned_disks_deleted.push(disk.slot.clone());
            }
        }

        let files = self.appliance.list_files(&self.base_path).await?;
        for file_path in files {
            if live_file_paths.contains(&file_path) {
                self.clear_seen(&file_path);
                continue;
            }
            report.orphaned_files_found.push(file_path.clone());
            if !self.past_grace(&file_path) {
                continue;
            }
            if self.dry_run {
                info!(file_path = %file_path, "dry-run: would delete orphaned backing file");
            } else {
                warn!(file_path = %file_path, "deleting orphaned backing file past grace period");
                self.appliance.delete_file(&file_path).await?;
                self.clear_seen(&file_path);
                report.orphaned_files_deleted.push(file_path.clone());
            }
        }

        metrics::record_reconciler_orphans_found("disk", report.orphaned_disks_found.len());
        metrics::record_reconciler_orphans_deleted("disk", report.orphaned_disks_deleted.len());
        metrics::record_reconciler_orphans_found("file", report.orphaned_files_found.len());
        metrics::record_reconciler_orphans_deleted("file", report.orphaned_files_deleted.len());

        Ok(report)
    }

    /// Run `run_once` on `interval` until the process exits. Errors from a
    /// single sweep are logged and do not stop the loop -- the next tick
    /// tries again.
    pub async fn run_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) if !report.orphaned_disks_found.is_empty() || !report.orphaned_files_found.is_empty() => {
                    info!(
                        disks_found = report.orphaned_disks_found.len(),
                        disks_deleted = report.orphaned_disks_deleted.len(),
                        files_found = report.orphaned_files_found.len(),
                        files_deleted = report.orphaned_files_deleted.len(),
                        dry_run = report.dry_run,
                        "orphan sweep completed"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "orphan sweep failed, retrying next interval"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_grace_is_false_until_grace_elapses() {
        let reconciler = OrphanReconciler::new(
            Arc::new(ApplianceClient::new(test_ssh())),
            Arc::new(InMemoryClusterVolumeStore::new()),
            "pvc-".to_string(),
            "/mnt/csi".to_string(),
            Duration::from_secs(300),
            true,
        );
        assert!(!reconciler.past_grace("pvc-orphan"));
        assert!(!reconciler.past_grace("pvc-orphan"));
    }

    #[test]
    fn past_grace_is_true_once_elapsed() {
        let reconciler = OrphanReconciler::new(
            Arc::new(ApplianceClient::new(test_ssh())),
            Arc::new(InMemoryClusterVolumeStore::new()),
            "pvc-".to_string(),
            "/mnt/csi".to_string(),
            Duration::from_millis(1),
            true,
        );
        assert!(!reconciler.past_grace("pvc-orphan"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(reconciler.past_grace("pvc-orphan"));
    }

    #[test]
    fn clear_seen_resets_the_grace_clock() {
        let reconciler = OrphanReconciler::new(
            Arc::new(ApplianceClient::new(test_ssh())),
            Arc::new(InMemoryClusterVolumeStore::new()),
            "pvc-".to_string(),
            "/mnt/csi".to_string(),
            Duration::from_millis(1),
            true,
        );
        reconciler.past_grace("pvc-x");
        std::thread::sleep(Duration::from_millis(5));
        reconciler.clear_seen("pvc-x");
        assert!(!reconciler.past_grace("pvc-x"));
    }

    fn test_ssh() -> Arc<crate::appliance::SshSessionManager> {
        use crate::appliance::ssh::SshConfig;
        crate::appliance::SshSessionManager::new(SshConfig {
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
        })
    }
}
