//! Controller configuration, parsed with `clap`'s derive API.
//!
//! Every value the orchestrator's pod spec needs to inject rather than
//! bake into an image gets an `env` fallback, mirroring how the node
//! agent is configured.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "CSI controller plugin for NVMe/TCP block volumes backed by an appliance")]
pub struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    pub endpoint: String,

    /// Node ID reported for this controller plugin instance
    #[arg(long, env = "CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Base NVMe NQN prefix; the per-volume NQN is `<prefix>:<volume_id>`.
    /// Must match every node agent's configured prefix.
    #[arg(long, env = "CONTROLLER_NQN_PREFIX", default_value = "nqn.2024-06.io.example.csi")]
    pub nqn_prefix: String,

    /// NVMe/TCP port volumes are exported on.
    #[arg(long, env = "CONTROLLER_NVME_PORT", default_value = "4420")]
    pub nvme_port: u16,

    /// Appliance SSH host (management address; may be a hostname).
    #[arg(long, env = "APPLIANCE_SSH_HOST")]
    pub appliance_host: String,

    /// Literal IP address nodes use to reach the appliance over NVMe/TCP.
    /// Distinct from the SSH management host: the storage network and the
    /// management network are not assumed to be the same interface.
    #[arg(long, env = "APPLIANCE_STORAGE_IP")]
    pub appliance_storage_ip: String,

    /// Appliance SSH port.
    #[arg(long, env = "APPLIANCE_SSH_PORT", default_value = "22")]
    pub appliance_port: u16,

    /// Appliance SSH username.
    #[arg(long, env = "APPLIANCE_SSH_USER", default_value = "csi")]
    pub appliance_user: String,

    /// Path to the mounted private key secret used to authenticate to the appliance.
    #[arg(long, env = "APPLIANCE_SSH_PRIVATE_KEY_PATH")]
    pub appliance_private_key_path: PathBuf,

    /// Pinned SHA256 host key fingerprint of the appliance, read from a mounted secret.
    #[arg(long, env = "APPLIANCE_SSH_HOST_KEY_SHA256")]
    pub appliance_host_key_sha256: String,

    /// Interval between liveness probes sent over the established SSH session.
    #[arg(long, env = "APPLIANCE_SSH_LIVENESS_PROBE_SECS", default_value = "30")]
    pub appliance_liveness_probe_secs: u64,

    /// Base backoff delay before the first SSH reconnect attempt.
    #[arg(long, env = "APPLIANCE_SSH_BACKOFF_BASE_SECS", default_value = "1")]
    pub appliance_backoff_base_secs: u64,

    /// Multiplier applied to the backoff delay after each failed reconnect attempt.
    #[arg(long, env = "APPLIANCE_SSH_BACKOFF_FACTOR", default_value = "2.0")]
    pub appliance_backoff_factor: f64,

    /// Ceiling on the SSH reconnect backoff delay.
    #[arg(long, env = "APPLIANCE_SSH_BACKOFF_CAP_SECS", default_value = "60")]
    pub appliance_backoff_cap_secs: u64,

    /// Fraction of random jitter applied to each backoff delay.
    #[arg(long, env = "APPLIANCE_SSH_BACKOFF_JITTER_RATIO", default_value = "0.1")]
    pub appliance_backoff_jitter_ratio: f64,

    /// Directory on the appliance that volume and snapshot backing files live under.
    #[arg(long, env = "APPLIANCE_BASE_PATH", default_value = "/mnt/csi")]
    pub appliance_base_path: String,

    /// Duration a multi-writer volume may stay dual-attached during live migration.
    #[arg(long, env = "CONTROLLER_MIGRATION_WINDOW_SECS", default_value = "120")]
    pub migration_window_secs: u64,

    /// Interval between orphan-reconciler sweeps.
    #[arg(long, env = "CONTROLLER_RECONCILER_INTERVAL_SECS", default_value = "3600")]
    pub reconciler_interval_secs: u64,

    /// Grace period an orphan candidate must persist across sweeps before being acted on.
    #[arg(long, env = "CONTROLLER_RECONCILER_GRACE_SECS", default_value = "300")]
    pub reconciler_grace_secs: u64,

    /// Log actions the reconciler would take without taking them. On by default.
    #[arg(long, env = "CONTROLLER_RECONCILER_DRY_RUN", default_value = "true")]
    pub reconciler_dry_run: bool,

    /// Prometheus metrics listen address.
    #[arg(long, env = "CONTROLLER_METRICS_ADDR", default_value = "0.0.0.0:9811")]
    pub metrics_addr: std::net::SocketAddr,

    /// CSI-mandated numeric verbosity: 0 errors, 2 outcomes, 4 diagnostics,
    /// 5 raw transport trace. Level 3 is deliberately unused. Used as the
    /// default `tracing` filter when `RUST_LOG` is unset.
    #[arg(short = 'v', long = "v", env = "CSI_LOG_VERBOSITY", default_value = "2")]
    pub verbosity: u8,
}

impl Args {
    /// Map the CSI verbosity flag to a `tracing::Level`, per §6/§10.1:
    /// 0→ERROR, 2→INFO, 4→DEBUG, 5→TRACE; odd/undefined values round down.
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 | 1 => "error",
            2 | 3 => "info",
            4 => "debug",
            _ => "trace",
        }
    }

    pub fn migration_window(&self) -> Duration {
        Duration::from_secs(self.migration_window_secs)
    }

    pub fn reconciler_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler_interval_secs)
    }

    pub fn reconciler_grace(&self) -> Duration {
        Duration::from_secs(self.reconciler_grace_secs)
    }

    pub fn ssh_config(&self) -> crate::appliance::ssh::SshConfig {
        crate::appliance::ssh::SshConfig {
            host: self.appliance_host.clone(),
            port: self.appliance_port,
            username: self.appliance_user.clone(),
            private_key_path: self.appliance_private_key_path.clone(),
            pinned_host_key_sha256: self.appliance_host_key_sha256.clone(),
            liveness_probe_interval: Duration::from_secs(self.appliance_liveness_probe_secs),
            backoff_base: Duration::from_secs(self.appliance_backoff_base_secs),
            backoff_factor: self.appliance_backoff_factor,
            backoff_cap: Duration::from_secs(self.appliance_backoff_cap_secs),
            backoff_jitter_ratio: self.appliance_backoff_jitter_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let args = Args::parse_from([
            "controller",
            "--appliance-host",
            "appliance.example",
            "--appliance-storage-ip",
            "10.0.0.5",
            "--appliance-private-key-path",
            "/secrets/id_ed25519",
            "--appliance-host-key-sha256",
            "deadbeef",
        ]);
        assert_eq!(args.migration_window(), Duration::from_secs(120));
        assert_eq!(args.reconciler_interval(), Duration::from_secs(3600));
        assert_eq!(args.reconciler_grace(), Duration::from_secs(300));
        assert!(args.reconciler_dry_run);
        assert_eq!(args.appliance_backoff_base_secs, 1);
        assert_eq!(args.appliance_backoff_factor, 2.0);
        assert_eq!(args.appliance_backoff_cap_secs, 60);
        assert_eq!(args.appliance_backoff_jitter_ratio, 0.1);
    }

    #[test]
    fn verbosity_maps_to_tracing_levels() {
        let parse_with = |v: &str| {
            Args::parse_from([
                "controller",
                "--appliance-host",
                "appliance.example",
                "--appliance-storage-ip",
                "10.0.0.5",
                "--appliance-private-key-path",
                "/secrets/id_ed25519",
                "--appliance-host-key-sha256",
                "deadbeef",
                "--v",
                v,
            ])
        };
        assert_eq!(parse_with("0").log_level(), "error");
        assert_eq!(parse_with("2").log_level(), "info");
        assert_eq!(parse_with("3").log_level(), "info");
        assert_eq!(parse_with("4").log_level(), "debug");
        assert_eq!(parse_with("5").log_level(), "trace");
    }

    #[test]
    fn ssh_config_carries_through_parsed_values() {
        let args = Args::parse_from([
            "controller",
            "--appliance-host",
            "appliance.example",
            "--appliance-storage-ip",
            "10.0.0.5",
            "--appliance-port",
            "2222",
            "--appliance-private-key-path",
            "/secrets/id_ed25519",
            "--appliance-host-key-sha256",
            "deadbeef",
        ]);
        let ssh = args.ssh_config();
        assert_eq!(ssh.host, "appliance.example");
        assert_eq!(ssh.port, 2222);
        assert_eq!(ssh.private_key_path, PathBuf::from("/secrets/id_ed25519"));
    }
}
