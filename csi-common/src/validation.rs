//! Pure request validation and string sanitization.
//!
//! Nothing in this module performs I/O. It exists so that every RPC handler
//! can reject malformed input before anything touches the appliance, SSH
//! session or kernel -- the same newtype-with-`FromStr` shape used for every
//! identifier in this driver.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;

use crate::error::DriverError;

const MIN_CAPACITY_BYTES: i64 = 1 << 30; // 1 GiB
const MAX_CAPACITY_BYTES: i64 = 16 * (1i64 << 40); // 16 TiB

const SHELL_METACHARACTERS: &[char] = &[
    '\'', '`', ';', '\n', '\r', '|', '&', '$', '(', ')', '<', '>', '\\', '"', '\0',
];

/// Mount options this driver will pass through to `mount`. Anything not
/// listed here is rejected with InvalidArgument, regardless of filesystem.
const ALLOWED_MOUNT_OPTIONS: &[&str] = &[
    "ro", "rw", "noatime", "relatime", "nodiratime", "sync", "async", "nodev", "nosuid", "noexec",
    "discard", "data=ordered", "data=writeback", "barrier", "nobarrier", "lazytime",
];

/// A validated CSI volume id of the form `pvc-<uuid v4>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VolumeId {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("pvc-").ok_or_else(|| {
            DriverError::invalid_argument(format!("volume id '{s}' must start with 'pvc-'"))
        })?;
        uuid::Uuid::parse_str(rest).map_err(|e| {
            DriverError::invalid_argument(format!("volume id '{s}' has invalid uuid suffix: {e}"))
        })?;
        Ok(VolumeId(s.to_string()))
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated CSI snapshot id of the form `snap-<32 hex>-at-<10 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SnapshotId {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("snap-").ok_or_else(|| {
            DriverError::invalid_argument(format!("snapshot id '{s}' must start with 'snap-'"))
        })?;
        let (uuid_part, tail) = rest.split_once("-at-").ok_or_else(|| {
            DriverError::invalid_argument(format!("snapshot id '{s}' missing '-at-' separator"))
        })?;
        if uuid_part.len() != 32 || !uuid_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DriverError::invalid_argument(format!(
                "snapshot id '{s}' has malformed uuid segment"
            )));
        }
        if tail.len() != 10 || !tail.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DriverError::invalid_argument(format!(
                "snapshot id '{s}' has malformed suffix segment"
            )));
        }
        Ok(SnapshotId(s.to_string()))
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reject hostnames: only literal IPv4/IPv6 addresses are accepted wherever
/// the appliance management or storage address is configured.
pub fn validate_ip_literal(s: &str) -> Result<IpAddr, DriverError> {
    IpAddr::from_str(s)
        .map_err(|_| DriverError::invalid_argument(format!("'{s}' is not a literal IP address")))
}

/// Reject strings containing characters that would have special meaning if
/// interpolated into an appliance CLI command or shell-invoked subprocess.
pub fn reject_shell_metacharacters(s: &str) -> Result<(), DriverError> {
    if let Some(c) = s.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(DriverError::invalid_argument(format!(
            "value '{s}' contains disallowed character '{c}'"
        )));
    }
    Ok(())
}

/// Clamp a CSI `CapacityRange.required_bytes` (0 means "unspecified") to the
/// supported volume size window, or reject it as OutOfRange.
pub fn clamp_capacity(requested_bytes: i64) -> Result<u64, DriverError> {
    if requested_bytes < 0 {
        return Err(DriverError::invalid_argument(
            "requested capacity cannot be negative",
        ));
    }
    if requested_bytes > MAX_CAPACITY_BYTES {
        return Err(DriverError::out_of_range(format!(
            "requested capacity {requested_bytes} bytes exceeds the 16 TiB maximum"
        )));
    }
    if requested_bytes < MIN_CAPACITY_BYTES {
        return Ok(MIN_CAPACITY_BYTES as u64);
    }
    Ok(requested_bytes as u64)
}

/// Validate requested mount options against the fixed allowlist.
pub fn validate_mount_options(options: &[String]) -> Result<(), DriverError> {
    for opt in options {
        reject_shell_metacharacters(opt)?;
        if !ALLOWED_MOUNT_OPTIONS.contains(&opt.as_str()) {
            return Err(DriverError::invalid_argument(format!(
                "mount option '{opt}' is not in the allowlist"
            )));
        }
    }
    Ok(())
}

/// A dynamically-registered set of filesystem path prefixes that paths used
/// in CLI commands or mount targets must be anchored inside. Seeded at
/// startup with the configured appliance volume base path; registering a
/// path is idempotent and runs sanitization first.
#[derive(Debug, Default)]
pub struct PathAllowlist {
    bases: RwLock<Vec<String>>,
}

impl PathAllowlist {
    pub fn new() -> Self {
        Self {
            bases: RwLock::new(Vec::new()),
        }
    }

    /// Register a new allowed base path. Idempotent; the path is sanitized
    /// before being added.
    pub fn register(&self, base_path: &str) -> Result<(), DriverError> {
        let sanitized = sanitize_path(base_path)?;
        let mut bases = self.bases.write().expect("path allowlist lock poisoned");
        if !bases.contains(&sanitized) {
            bases.push(sanitized);
        }
        Ok(())
    }

    /// Check that `path` is sanitized and anchored under one of the
    /// registered base paths.
    pub fn check(&self, path: &str) -> Result<(), DriverError> {
        let sanitized = sanitize_path(path)?;
        let bases = self.bases.read().expect("path allowlist lock poisoned");
        let anchored = bases.iter().any(|base| {
            sanitized == *base || sanitized.starts_with(&format!("{}/", base.trim_end_matches('/')))
        });
        if anchored {
            Ok(())
        } else {
            Err(DriverError::invalid_argument(format!(
                "path '{path}' is not within an allowed base path"
            )))
        }
    }
}

fn sanitize_path(path: &str) -> Result<String, DriverError> {
    reject_shell_metacharacters(path)?;
    if !path.starts_with('/') {
        return Err(DriverError::invalid_argument(format!(
            "path '{path}' must be absolute"
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(DriverError::invalid_argument(format!(
            "path '{path}' contains a traversal segment"
        )));
    }
    Ok(path.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_accepts_well_formed() {
        let id = format!("pvc-{}", uuid::Uuid::new_v4());
        assert!(VolumeId::from_str(&id).is_ok());
    }

    #[test]
    fn volume_id_rejects_missing_prefix() {
        assert!(VolumeId::from_str(&uuid::Uuid::new_v4().to_string()).is_err());
    }

    #[test]
    fn volume_id_rejects_non_uuid_suffix() {
        assert!(VolumeId::from_str("pvc-not-a-uuid").is_err());
    }

    #[test]
    fn snapshot_id_round_trips_through_generator() {
        let id = crate::ids::snapshot_id_for_name("demo");
        assert!(SnapshotId::from_str(&id).is_ok());
    }

    #[test]
    fn snapshot_id_rejects_malformed() {
        assert!(SnapshotId::from_str("snap-short-at-abc").is_err());
        assert!(SnapshotId::from_str("not-a-snapshot-id").is_err());
    }

    #[test]
    fn ip_literal_accepts_v4_and_v6() {
        assert!(validate_ip_literal("10.0.0.5").is_ok());
        assert!(validate_ip_literal("::1").is_ok());
    }

    #[test]
    fn ip_literal_rejects_hostnames() {
        assert!(validate_ip_literal("storage.example.com").is_err());
        assert!(validate_ip_literal("localhost").is_err());
    }

    #[test]
    fn shell_metacharacters_are_rejected() {
        assert!(reject_shell_metacharacters("pvc-safe-name").is_ok());
        assert!(reject_shell_metacharacters("name; rm -rf /").is_err());
        assert!(reject_shell_metacharacters("$(whoami)").is_err());
        assert!(reject_shell_metacharacters("name`id`").is_err());
        assert!(reject_shell_metacharacters("line1\nline2").is_err());
    }

    #[test]
    fn capacity_below_minimum_clamps_up() {
        assert_eq!(clamp_capacity(0).unwrap(), MIN_CAPACITY_BYTES as u64);
        assert_eq!(clamp_capacity(1024).unwrap(), MIN_CAPACITY_BYTES as u64);
    }

    #[test]
    fn capacity_above_maximum_is_out_of_range() {
        let err = clamp_capacity(MAX_CAPACITY_BYTES + 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfRange);
    }

    #[test]
    fn capacity_within_range_passes_through() {
        let req = MIN_CAPACITY_BYTES * 5;
        assert_eq!(clamp_capacity(req).unwrap(), req as u64);
    }

    #[test]
    fn mount_options_allowlist_accepts_known_options() {
        assert!(validate_mount_options(&["ro".to_string(), "noatime".to_string()]).is_ok());
    }

    #[test]
    fn mount_options_allowlist_rejects_suid() {
        let err = validate_mount_options(&["suid".to_string()]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn mount_options_allowlist_rejects_unknown() {
        assert!(validate_mount_options(&["exec".to_string()]).is_err());
    }

    #[test]
    fn path_allowlist_registration_is_idempotent() {
        let allowlist = PathAllowlist::new();
        allowlist.register("/srv/csi-volumes").unwrap();
        allowlist.register("/srv/csi-volumes").unwrap();
        allowlist.check("/srv/csi-volumes/pvc-abc").unwrap();
    }

    #[test]
    fn path_allowlist_rejects_paths_outside_base() {
        let allowlist = PathAllowlist::new();
        allowlist.register("/srv/csi-volumes").unwrap();
        assert!(allowlist.check("/etc/passwd").is_err());
        assert!(allowlist.check("/srv/csi-volumes-evil/x").is_err());
    }

    #[test]
    fn path_allowlist_rejects_traversal() {
        let allowlist = PathAllowlist::new();
        allowlist.register("/srv/csi-volumes").unwrap();
        assert!(allowlist.check("/srv/csi-volumes/../etc/passwd").is_err());
    }
}
