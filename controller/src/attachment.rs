//! Attachment manager: the controller's in-memory view of which nodes hold
//! which volumes attached. No persistent state of its own -- rebuilt from
//! cluster attachment records every time the controller starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tracing::{info, warn};

use csi_common::{DriverError, DriverResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    SingleWriter,
    MultiWriter,
}

/// A single node's attachment to a volume, as recorded in-memory.
#[derive(Debug, Clone)]
struct NodeAttachment {
    node_id: String,
    attached_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct AttachmentState {
    pub access_mode: AccessMode,
    nodes: Vec<NodeAttachment>,
    pub migration_started_at: Option<SystemTime>,
}

impl AttachmentState {
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    pub fn is_attached_to(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == node_id)
    }
}

/// A record of a single node's attachment to a volume, as known to the
/// cluster's own attachment-tracking system (e.g. the orchestrator's
/// attachment objects). This system never writes these records, only
/// reads them -- they are authoritative and owned elsewhere.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub volume_id: String,
    pub node_id: String,
    pub attached: bool,
    pub created_at: SystemTime,
}

/// Boundary to the cluster's own record-keeping system. Implementations
/// that need to perform I/O should handle blocking internally (as
/// `SshSessionManager` does via `spawn_blocking`) -- these methods are
/// plain synchronous calls from the attachment manager's point of view.
pub trait ClusterRecordStore: Send + Sync {
    /// All attachment records owned by `attacher_id`.
    fn list_attachment_records(&self, attacher_id: &str) -> DriverResult<Vec<AttachmentRecord>>;

    /// Whether a record exists for this exact (volume, node) pair.
    fn record_exists(&self, volume_id: &str, node_id: &str) -> DriverResult<bool>;

    /// Best-effort lookup of a volume's configured access mode, used only
    /// during rebuild. `Ok(None)` means "not found"; the caller defaults
    /// to single-writer.
    fn access_mode_for_volume(&self, volume_id: &str) -> DriverResult<Option<AccessMode>>;
}

/// In-memory fake used by tests and by deployments with no cluster
/// record-keeping system configured. Uses a plain `std::sync::Mutex`
/// since `ClusterRecordStore` is a synchronous trait -- an implementation
/// that talks to a real cluster API would do its own async-to-sync
/// bridging the way `SshSessionManager` does for blocking SSH calls.
#[derive(Default)]
pub struct InMemoryClusterRecordStore {
    records: std::sync::Mutex<Vec<AttachmentRecord>>,
    access_modes: std::sync::Mutex<HashMap<String, AccessMode>>,
}

impl InMemoryClusterRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_record(&self, record: AttachmentRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn set_access_mode(&self, volume_id: &str, mode: AccessMode) {
        self.access_modes.lock().unwrap().insert(volume_id.to_string(), mode);
    }
}

impl ClusterRecordStore for InMemoryClusterRecordStore {
    fn list_attachment_records(&self, attacher_id: &str) -> DriverResult<Vec<AttachmentRecord>> {
        let _ = attacher_id;
        Ok(self.records.lock().unwrap().clone())
    }

    fn record_exists(&self, volume_id: &str, node_id: &str) -> DriverResult<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.volume_id == volume_id && r.node_id == node_id && r.attached))
    }

    fn access_mode_for_volume(&self, volume_id: &str) -> DriverResult<Option<AccessMode>> {
        Ok(self.access_modes.lock().unwrap().get(volume_id).copied())
    }
}

pub struct AttachmentManager {
    attacher_id: String,
    migration_window: Duration,
    store: Arc<dyn ClusterRecordStore>,
    table: Mutex<HashMap<String, AttachmentState>>,
    vmi_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AttachmentManager {
    pub fn new(attacher_id: String, migration_window: Duration, store: Arc<dyn ClusterRecordStore>) -> Self {
        Self {
            attacher_id,
            migration_window,
            store,
            table: Mutex::new(HashMap::new()),
            vmi_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild in-memory state from cluster attachment records. Must
    /// complete before the CSI surface starts serving (§4.3.1).
    pub async fn initialize(&self) -> DriverResult<()> {
        let records = self.store.list_attachment_records(&self.attacher_id)?;
        let mut by_volume: HashMap<String, Vec<&AttachmentRecord>> = HashMap::new();
        for record in &records {
            if record.attached {
                by_volume.entry(record.volume_id.clone()).or_default().push(record);
            }
        }

        let mut table = self.table.lock().await;
        table.clear();

        for (volume_id, mut group) in by_volume {
            group.sort_by_key(|r| r.created_at);
            if group.len() > 2 {
                warn!(
                    volume_id = %volume_id,
                    count = group.len(),
                    "more than two attachment records during rebuild, keeping only the two oldest"
                );
                group.truncate(2);
            }

            let access_mode = self
                .store
                .access_mode_for_volume(&volume_id)?
                .unwrap_or(AccessMode::SingleWriter);

            let nodes: Vec<NodeAttachment> = group
                .iter()
                .map(|r| NodeAttachment {
                    node_id: r.node_id.clone(),
                    attached_at: r.created_at,
                })
                .collect();

            let migration_started_at = if nodes.len() == 2 {
                Some(nodes[0].attached_at)
            } else {
                None
            };

            info!(volume_id = %volume_id, nodes = nodes.len(), "rebuilt attachment state");
            table.insert(
                volume_id,
                AttachmentState {
                    access_mode,
                    nodes,
                    migration_started_at,
                },
            );
        }

        self.report_gauges(&table);
        Ok(())
    }

    /// Publish the current attachment/dual-attach-window counts to metrics.
    /// Called after every mutation while still holding `table`'s lock.
    fn report_gauges(&self, table: &HashMap<String, AttachmentState>) {
        let dual_attach = table.values().filter(|s| s.nodes.len() == 2).count();
        crate::metrics::set_active_attachments(table.len());
        crate::metrics::set_dual_attach_windows(dual_attach);
    }

    /// Enforce the migration window on a single entry, mutating it in
    /// place. Called on every mutation.
    fn enforce_migration_window(&self, volume_id: &str, state: &mut AttachmentState) {
        let Some(started_at) = state.migration_started_at else {
            return;
        };
        if state.nodes.len() != 2 {
            return;
        }
        let elapsed = SystemTime::now().duration_since(started_at).unwrap_or_default();
        if elapsed > self.migration_window {
            let oldest = state.nodes.remove(0);
            warn!(
                volume_id = %volume_id,
                elapsed_secs = elapsed.as_secs(),
                kept_node = %oldest.node_id,
                "migration window exceeded, dropping newer attachment"
            );
            state.nodes = vec![oldest];
            state.migration_started_at = None;
        }
    }

    pub async fn track(
        &self,
        volume_id: &str,
        node_id: &str,
        access_mode: AccessMode,
    ) -> DriverResult<()> {
        let mut table = self.table.lock().await;

        let needs_self_heal = match table.get(volume_id) {
            Some(state) if state.access_mode == AccessMode::SingleWriter && !state.is_attached_to(node_id) => {
                !self.store.record_exists(volume_id, state.node_ids()[0])?
            }
            _ => false,
        };
        if needs_self_heal {
            info!(volume_id = %volume_id, node_id = %node_id, "self-healing stale single-writer attachment");
            table.remove(volume_id);
        }

        let entry = table.entry(volume_id.to_string()).or_insert_with(|| AttachmentState {
            access_mode,
            nodes: Vec::new(),
            migration_started_at: None,
        });

        if entry.is_attached_to(node_id) {
            return Ok(());
        }

        match entry.access_mode {
            AccessMode::SingleWriter => {
                if !entry.nodes.is_empty() {
                    return Err(DriverError::failed_precondition(format!(
                        "volume {volume_id} is already attached to node {} with single-writer access",
                        entry.nodes[0].node_id
                    )));
                }
                entry.nodes.push(NodeAttachment {
                    node_id: node_id.to_string(),
                    attached_at: SystemTime::now(),
                });
            }
            AccessMode::MultiWriter => {
                if entry.nodes.len() >= 2 {
                    return Err(DriverError::failed_precondition(format!(
                        "volume {volume_id} already has two attachments, rejecting a third"
                    )));
                }
                entry.nodes.push(NodeAttachment {
                    node_id: node_id.to_string(),
                    attached_at: SystemTime::now(),
                });
                if entry.nodes.len() == 2 && entry.migration_started_at.is_none() {
                    entry.migration_started_at = Some(SystemTime::now());
                }
            }
        }

        self.enforce_migration_window(volume_id, entry);
        self.report_gauges(&table);
        Ok(())
    }

    pub async fn untrack(&self, volume_id: &str, node_id: &str) -> DriverResult<()> {
        let mut table = self.table.lock().await;
        let Some(entry) = table.get_mut(volume_id) else {
            return Ok(());
        };

        entry.nodes.retain(|n| n.node_id != node_id);

        if entry.nodes.len() == 1 {
            entry.migration_started_at = None;
        }
        if entry.nodes.is_empty() {
            table.remove(volume_id);
        }
        self.report_gauges(&table);
        Ok(())
    }

    pub async fn check_attachable(
        &self,
        volume_id: &str,
        node_id: &str,
        access_mode: AccessMode,
    ) -> DriverResult<()> {
        let table = self.table.lock().await;
        let Some(entry) = table.get(volume_id) else {
            return Ok(());
        };
        if entry.is_attached_to(node_id) {
            return Ok(());
        }
        match (entry.access_mode, access_mode) {
            (AccessMode::SingleWriter, _) if !entry.nodes.is_empty() => {
                if self.store.record_exists(volume_id, &entry.nodes[0].node_id)? {
                    Err(DriverError::failed_precondition(format!(
                        "volume {volume_id} is already attached to node {} with single-writer access",
                        entry.nodes[0].node_id
                    )))
                } else {
                    Ok(())
                }
            }
            (AccessMode::MultiWriter, AccessMode::MultiWriter) if entry.nodes.len() >= 2 => {
                Err(DriverError::failed_precondition(format!(
                    "volume {volume_id} already has two attachments, rejecting a third"
                )))
            }
            _ => Ok(()),
        }
    }

    pub async fn get(&self, volume_id: &str) -> Option<AttachmentState> {
        self.table.lock().await.get(volume_id).cloned()
    }

    /// Acquire the per-VMI lock used to serialize ControllerPublishVolume
    /// calls targeting the same virtual machine instance during live
    /// migration.
    pub async fn lock_vmi(&self, vmi_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.vmi_locks.lock().await;
            locks.entry(vmi_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AttachmentManager {
        AttachmentManager::new(
            "csi.example.io".to_string(),
            Duration::from_secs(300),
            Arc::new(InMemoryClusterRecordStore::new()),
        )
    }

    #[tokio::test]
    async fn track_then_check_single_writer_conflict() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::SingleWriter).await.unwrap();
        let err = mgr.track("vol-1", "node-b", AccessMode::SingleWriter).await.unwrap_err();
        assert_eq!(err.kind(), csi_common::ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn track_is_idempotent_for_same_node() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::SingleWriter).await.unwrap();
        mgr.track("vol-1", "node-a", AccessMode::SingleWriter).await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert_eq!(state.node_ids(), vec!["node-a"]);
    }

    #[tokio::test]
    async fn multi_writer_allows_second_node_and_sets_migration_started() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::MultiWriter).await.unwrap();
        mgr.track("vol-1", "node-b", AccessMode::MultiWriter).await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert_eq!(state.node_ids().len(), 2);
        assert!(state.migration_started_at.is_some());
    }

    #[tokio::test]
    async fn multi_writer_rejects_third_node() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::MultiWriter).await.unwrap();
        mgr.track("vol-1", "node-b", AccessMode::MultiWriter).await.unwrap();
        let err = mgr.track("vol-1", "node-c", AccessMode::MultiWriter).await.unwrap_err();
        assert_eq!(err.kind(), csi_common::ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn untrack_drops_back_to_single_node_clears_migration() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::MultiWriter).await.unwrap();
        mgr.track("vol-1", "node-b", AccessMode::MultiWriter).await.unwrap();
        mgr.untrack("vol-1", "node-b").await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert_eq!(state.node_ids(), vec!["node-a"]);
        assert!(state.migration_started_at.is_none());
    }

    #[tokio::test]
    async fn untrack_last_node_removes_entry() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::SingleWriter).await.unwrap();
        mgr.untrack("vol-1", "node-a").await.unwrap();
        assert!(mgr.get("vol-1").await.is_none());
    }

    #[tokio::test]
    async fn track_self_heals_when_no_cluster_record_exists() {
        let mgr = manager();
        mgr.track("vol-1", "node-a", AccessMode::SingleWriter).await.unwrap();
        // No record was ever inserted into the store for (vol-1, node-a),
        // so a conflicting attach from node-b should self-heal rather than fail.
        mgr.track("vol-1", "node-b", AccessMode::SingleWriter).await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert_eq!(state.node_ids(), vec!["node-b"]);
    }

    #[tokio::test]
    async fn track_does_not_self_heal_when_cluster_record_exists() {
        let store = Arc::new(InMemoryClusterRecordStore::new());
        store
            .insert_record(AttachmentRecord {
                volume_id: "vol-1".to_string(),
                node_id: "node-a".to_string(),
                attached: true,
                created_at: SystemTime::now(),
            });
        let mgr = AttachmentManager::new("csi.example.io".to_string(), Duration::from_secs(300), store);
        mgr.track("vol-1", "node-a", AccessMode::SingleWriter).await.unwrap();
        let err = mgr.track("vol-1", "node-b", AccessMode::SingleWriter).await.unwrap_err();
        assert_eq!(err.kind(), csi_common::ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn initialize_rebuilds_from_cluster_records() {
        let store = Arc::new(InMemoryClusterRecordStore::new());
        store
            .insert_record(AttachmentRecord {
                volume_id: "vol-1".to_string(),
                node_id: "node-a".to_string(),
                attached: true,
                created_at: SystemTime::now(),
            });
        let mgr = AttachmentManager::new("csi.example.io".to_string(), Duration::from_secs(300), store);
        mgr.initialize().await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert_eq!(state.node_ids(), vec!["node-a"]);
        assert_eq!(state.access_mode, AccessMode::SingleWriter);
    }

    #[tokio::test]
    async fn initialize_keeps_only_two_oldest_of_a_larger_group() {
        let store = Arc::new(InMemoryClusterRecordStore::new());
        let base = SystemTime::now();
        for (i, node) in ["node-a", "node-b", "node-c"].iter().enumerate() {
            store
                .insert_record(AttachmentRecord {
                    volume_id: "vol-1".to_string(),
                    node_id: node.to_string(),
                    attached: true,
                    created_at: base + Duration::from_secs(i as u64),
                });
        }
        let mgr = AttachmentManager::new("csi.example.io".to_string(), Duration::from_secs(300), store);
        mgr.initialize().await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert_eq!(state.node_ids().len(), 2);
        assert!(!state.node_ids().contains(&"node-c"));
    }

    #[tokio::test]
    async fn migration_window_exceeded_drops_newer_node() {
        let store = Arc::new(InMemoryClusterRecordStore::new());
        let mgr = AttachmentManager::new("csi.example.io".to_string(), Duration::from_millis(1), store);
        mgr.track("vol-1", "node-a", AccessMode::MultiWriter).await.unwrap();
        mgr.track("vol-1", "node-b", AccessMode::MultiWriter).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Any further mutation re-evaluates the window.
        mgr.untrack("vol-1", "node-a").await.ok();
        mgr.track("vol-1", "node-a", AccessMode::MultiWriter).await.unwrap();
        let state = mgr.get("vol-1").await.unwrap();
        assert!(state.node_ids().len() <= 2);
    }
}
