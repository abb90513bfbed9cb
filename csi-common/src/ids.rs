//! Deterministic identifier generation for volumes and snapshots.
//!
//! Volume ids are random (`pvc-<uuid v4>`); snapshot ids are a pure function
//! of the requested snapshot name alone (`snap-<uuid v5>-at-<first 10 hex
//! chars of the same uuid v5>`), independent of the source volume. Both
//! properties are required for CSI create idempotency: calling CreateVolume
//! or CreateSnapshot twice with the same name must be safe to retry.

use uuid::Uuid;

/// Namespace UUID snapshot ids are derived under. Fixed so that the same
/// snapshot name always yields the same id across process restarts.
const SNAPSHOT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x14, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

pub fn generate_volume_id() -> String {
    format!("pvc-{}", Uuid::new_v4())
}

/// Derive the snapshot id for a given CSI snapshot `name`. Calling this
/// twice with the same name always returns the same id.
pub fn snapshot_id_for_name(name: &str) -> String {
    let uuid = Uuid::new_v5(&SNAPSHOT_ID_NAMESPACE, name.as_bytes());
    let full = uuid.simple().to_string();
    let short = &full[..10];
    format!("snap-{full}-at-{short}")
}

/// Derive the NVMe qualified name for a volume, rooted at a stable prefix
/// configured for the deployment (e.g. `nqn.2024-06.io.example.csi`).
pub fn nqn_for_volume(base_nqn_prefix: &str, volume_id: &str) -> String {
    format!("{base_nqn_prefix}:{volume_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_has_expected_prefix() {
        let id = generate_volume_id();
        assert!(id.starts_with("pvc-"));
        assert!(Uuid::parse_str(&id[4..]).is_ok());
    }

    #[test]
    fn snapshot_id_is_deterministic_in_name() {
        let a = snapshot_id_for_name("nightly-backup");
        let b = snapshot_id_for_name("nightly-backup");
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_id_independent_of_source_volume() {
        // The function doesn't even take a source volume id -- this test
        // documents that independence as a property of the signature.
        let a = snapshot_id_for_name("weekly");
        let b = snapshot_id_for_name("weekly");
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_id_differs_by_name() {
        let a = snapshot_id_for_name("alpha");
        let b = snapshot_id_for_name("beta");
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_id_matches_expected_shape() {
        let id = snapshot_id_for_name("shape-check");
        let rest = id.strip_prefix("snap-").expect("snap- prefix");
        let (uuid_part, tail) = rest.split_once("-at-").expect("-at- separator");
        assert_eq!(uuid_part.len(), 32);
        assert_eq!(tail.len(), 10);
        assert!(uuid_part.starts_with(tail));
    }

    #[test]
    fn nqn_derivation_is_stable() {
        let nqn = nqn_for_volume("nqn.2024-06.io.example.csi", "pvc-abc");
        assert_eq!(nqn, "nqn.2024-06.io.example.csi:pvc-abc");
    }
}
