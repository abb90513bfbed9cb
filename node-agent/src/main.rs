//! Node agent: the per-node half of the CSI driver. Connects NVMe/TCP
//! targets, formats and mounts volumes, and watches for stale mounts left
//! behind by a dead appliance link.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use node_agent::csi::identity_server::IdentityServer;
use node_agent::csi::node_server::NodeServer;
use node_agent::{orphan, IdentityService, NodeService, NvmeConnector};

#[derive(Parser, Debug)]
#[command(name = "node-agent")]
#[command(about = "CSI node agent for NVMe/TCP block volumes")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Base NVMe NQN prefix; the per-volume NQN is `<prefix>:<volume_id>`.
    /// Must match the controller's configured prefix.
    #[arg(long, env = "NODE_AGENT_NQN_PREFIX", default_value = "nqn.2024-06.io.example.csi")]
    nqn_prefix: String,

    /// Upper bound reported to the orchestrator for volumes stageable on this node.
    #[arg(long, env = "NODE_AGENT_MAX_VOLUMES", default_value = "256")]
    max_volumes_per_node: i64,

    /// Prometheus metrics listen address
    #[arg(long, env = "NODE_AGENT_METRICS_ADDR", default_value = "0.0.0.0:9810")]
    metrics_addr: std::net::SocketAddr,

    /// CSI-mandated numeric verbosity: 0 errors, 2 outcomes, 4 diagnostics,
    /// 5 raw transport trace. Level 3 is deliberately unused. Used as the
    /// default `tracing` filter when `RUST_LOG` is unset.
    #[arg(short = 'v', long = "v", env = "CSI_LOG_VERBOSITY", default_value = "2")]
    verbosity: u8,
}

/// Map the CSI verbosity flag to a `tracing::Level`, per §6/§10.1:
/// 0→ERROR, 2→INFO, 4→DEBUG, 5→TRACE; odd/undefined values round down.
fn log_level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 | 1 => "error",
        2 | 3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

fn init_tracing(log_level: &str) {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_tracing_levels() {
        assert_eq!(log_level_for(0), "error");
        assert_eq!(log_level_for(1), "error");
        assert_eq!(log_level_for(2), "info");
        assert_eq!(log_level_for(3), "info");
        assert_eq!(log_level_for(4), "debug");
        assert_eq!(log_level_for(5), "trace");
        assert_eq!(log_level_for(9), "trace");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(log_level_for(args.verbosity));

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        node_id = %node_id,
        endpoint = %args.endpoint,
        nqn_prefix = %args.nqn_prefix,
        "starting node agent"
    );

    if let Err(e) = node_agent::metrics::init_metrics(args.metrics_addr) {
        tracing::warn!(error = %e, "failed to start metrics exporter, continuing without it");
    }

    let ready = Arc::new(AtomicBool::new(false));
    match orphan::sweep(&NvmeConnector::new()) {
        Ok(cleaned) if !cleaned.is_empty() => {
            info!(count = cleaned.len(), "cleaned orphan nvme subsystems at startup")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "startup orphan sweep failed, continuing"),
    }
    ready.store(true, std::sync::atomic::Ordering::SeqCst);

    let identity_service = IdentityService::new(ready);
    let node_service = NodeService::new(node_id, args.nqn_prefix, args.max_volumes_per_node);

    let socket_path = args
        .endpoint
        .strip_prefix("unix://")
        .unwrap_or(&args.endpoint);
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = Path::new(socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(socket_path = %socket_path, "listening for csi requests");

    Server::builder()
        .add_service(IdentityServer::new(identity_service))
        .add_service(NodeServer::new(node_service))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await?;

    Ok(())
}
