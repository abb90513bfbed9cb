//! Snapshot engine: a thin, idempotency-aware orchestrator over the
//! appliance client's copy-on-write disk cloning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;
use tracing::warn;

use csi_common::ids::snapshot_id_for_name;
use csi_common::{DriverError, DriverResult};

use crate::appliance::{ApplianceClient, ApplianceSnapshot, ApplianceVolume};

pub struct SnapshotEngine {
    appliance: Arc<ApplianceClient>,
    base_path: String,
    /// Maps a snapshot id to the source volume id it was created from.
    /// The appliance's `copy-from` parameter is write-only at creation
    /// time and is not retained on the resulting disk entry, so this is
    /// the only place that remembers the binding -- lost across a
    /// controller restart, in which case a retried CreateSnapshot for an
    /// already-materialized snapshot is trusted rather than rejected (see
    /// the design ledger for this module).
    source_volumes: Mutex<HashMap<String, String>>,
    /// Best-effort creation timestamp, observed locally the first time
    /// this controller sees a snapshot id created. Like `source_volumes`,
    /// lost across a restart -- the appliance itself reports no
    /// creation-time field, so CSI's required `creation_time` field is
    /// approximated rather than authoritative.
    created_at: Mutex<HashMap<String, SystemTime>>,
}

impl SnapshotEngine {
    pub fn new(appliance: Arc<ApplianceClient>, base_path: String) -> Self {
        Self {
            appliance,
            base_path,
            source_volumes: Mutex::new(HashMap::new()),
            created_at: Mutex::new(HashMap::new()),
        }
    }

    /// Best-effort creation time for `snapshot_id`, if this controller
    /// observed its creation since the last restart.
    pub async fn created_at(&self, snapshot_id: &str) -> Option<SystemTime> {
        self.created_at.lock().await.get(snapshot_id).copied()
    }

    /// Best-effort source volume id for `snapshot_id`, if this controller
    /// has a cached binding for it (see `source_volumes`). `None` after a
    /// restart for a snapshot this controller didn't itself create.
    pub async fn source_volume_for(&self, snapshot_id: &str) -> Option<String> {
        self.source_volumes.lock().await.get(snapshot_id).cloned()
    }

    fn file_path(&self, id: &str) -> String {
        format!("{}/{id}.img", self.base_path)
    }

    pub async fn create_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
    ) -> DriverResult<ApplianceSnapshot> {
        let id = snapshot_id_for_name(name);
        let cached_source = self.source_volumes.lock().await.get(&id).cloned();

        if let Some(existing) = self.appliance.get_snapshot(&id).await? {
            return match cached_source {
                Some(src) if src == source_volume_id => Ok(existing),
                Some(src) => Err(DriverError::already_exists(format!(
                    "snapshot name {name} already exists for source volume {src}, not {source_volume_id}"
                ))),
                None => {
                    warn!(
                        snapshot_id = %id,
                        "snapshot already exists on the appliance with no cached source binding \
                         (likely a controller restart); trusting the existing record"
                    );
                    self.source_volumes
                        .lock()
                        .await
                        .insert(id.clone(), source_volume_id.to_string());
                    self.created_at.lock().await.entry(id).or_insert_with(SystemTime::now);
                    Ok(existing)
                }
            };
        }

        let file_path = self.file_path(&id);
        let snapshot = self
            .appliance
            .create_snapshot(&id, source_volume_id, &file_path)
            .await?;
        self.source_volumes.lock().await.insert(id.clone(), source_volume_id.to_string());
        self.created_at.lock().await.insert(id, SystemTime::now());
        Ok(snapshot)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> DriverResult<()> {
        self.appliance.delete_snapshot(snapshot_id).await?;
        self.source_volumes.lock().await.remove(snapshot_id);
        self.created_at.lock().await.remove(snapshot_id);
        Ok(())
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> DriverResult<Option<ApplianceSnapshot>> {
        self.appliance.get_snapshot(snapshot_id).await
    }

    /// List snapshots, optionally filtered to a source volume. The filter
    /// can only match snapshots whose source binding is still cached (see
    /// `source_volumes`); post-restart entries with no cached binding are
    /// omitted from a filtered list rather than risk a false match.
    pub async fn list_snapshots(&self, source_volume_filter: Option<&str>) -> DriverResult<Vec<ApplianceSnapshot>> {
        let all = self.appliance.list_snapshots("snap-").await?;
        let Some(filter) = source_volume_filter else {
            return Ok(all);
        };
        let cache = self.source_volumes.lock().await;
        Ok(all
            .into_iter()
            .filter(|s| cache.get(&s.slot).map(|src| src == filter).unwrap_or(false))
            .collect())
    }

    /// Restore `snapshot_id` into a new volume. The restored volume may be
    /// larger than the snapshot but never smaller (§4.2).
    pub async fn restore_snapshot(
        &self,
        new_volume_id: &str,
        snapshot_id: &str,
        requested_size_bytes: u64,
        nqn: &str,
        port: u16,
    ) -> DriverResult<ApplianceVolume> {
        let snapshot = self
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("snapshot {snapshot_id} does not exist")))?;
        if requested_size_bytes < snapshot.size_bytes {
            return Err(DriverError::out_of_range(format!(
                "requested size {requested_size_bytes} is smaller than snapshot size {}",
                snapshot.size_bytes
            )));
        }

        let file_path = self.file_path(new_volume_id);
        self.appliance
            .restore_snapshot(new_volume_id, snapshot_id, requested_size_bytes, &file_path, nqn, port)
            .await
    }
}
