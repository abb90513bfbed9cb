//! End-to-end coverage of the attachment manager's restart rebuild against
//! its public API, exercising the controller-restart-with-two-attachments
//! scenario as a single flow rather than the individual rebuild steps
//! already covered by `attachment.rs`'s own unit tests.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use controller::attachment::{AccessMode, AttachmentManager, AttachmentRecord, InMemoryClusterRecordStore};

#[tokio::test]
async fn restart_with_two_attachments_preserves_migration_window_and_blocks_a_third_node() {
    let store = Arc::new(InMemoryClusterRecordStore::new());
    let t0 = SystemTime::now();
    store.insert_record(AttachmentRecord {
        volume_id: "pvc-migrating".to_string(),
        node_id: "n1".to_string(),
        attached: true,
        created_at: t0,
    });
    store.insert_record(AttachmentRecord {
        volume_id: "pvc-migrating".to_string(),
        node_id: "n2".to_string(),
        attached: true,
        created_at: t0 + Duration::from_secs(5),
    });
    store.set_access_mode("pvc-migrating", AccessMode::MultiWriter);

    // A fresh manager with an empty in-memory table, as the controller
    // constructs one on every restart -- nothing is carried over except
    // what `initialize` reads back from the cluster record store.
    let manager = AttachmentManager::new("csi.example.io".to_string(), Duration::from_secs(300), store);
    manager.initialize().await.expect("rebuild from cluster records");

    let state = manager.get("pvc-migrating").await.expect("rebuilt entry exists");
    assert_eq!(state.access_mode, AccessMode::MultiWriter);
    assert_eq!(state.node_ids(), vec!["n1", "n2"]);
    assert_eq!(state.migration_started_at, Some(t0));

    let err = manager
        .track("pvc-migrating", "n3", AccessMode::MultiWriter)
        .await
        .expect_err("a third node must be rejected mid-migration");
    assert_eq!(err.kind(), csi_common::ErrorKind::FailedPrecondition);
}

#[tokio::test]
async fn restart_with_no_records_starts_every_volume_unattached() {
    let manager = AttachmentManager::new(
        "csi.example.io".to_string(),
        Duration::from_secs(300),
        Arc::new(InMemoryClusterRecordStore::new()),
    );
    manager.initialize().await.expect("rebuild with no records succeeds");
    assert!(manager.get("pvc-never-seen").await.is_none());

    // A fresh publish after an empty rebuild behaves like first-ever attach.
    manager.track("pvc-never-seen", "n1", AccessMode::SingleWriter).await.unwrap();
    let state = manager.get("pvc-never-seen").await.unwrap();
    assert_eq!(state.node_ids(), vec!["n1"]);
}
