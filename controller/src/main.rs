//! CSI controller: the cluster-wide half of the CSI driver. Manages volume
//! and snapshot lifecycle on the appliance over SSH, tracks attachment
//! state across the dual-attach migration window, and runs a periodic
//! orphan reconciler.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use controller::appliance::{ApplianceClient, SshSessionManager};
use controller::attachment::{AttachmentManager, InMemoryClusterRecordStore};
use controller::config::Args;
use controller::csi::controller_server::ControllerServer;
use controller::csi::identity_server::IdentityServer;
use controller::identity::ReadinessState;
use controller::reconciler::{InMemoryClusterVolumeStore, OrphanReconciler};
use controller::snapshot::SnapshotEngine;
use controller::{ControllerService, IdentityService};

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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_level());

    let node_id = match args.node_id.clone() {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        node_id = %node_id,
        endpoint = %args.endpoint,
        nqn_prefix = %args.nqn_prefix,
        appliance_host = %args.appliance_host,
        "starting csi controller"
    );

    if let Err(e) = controller::metrics::init_metrics(args.metrics_addr) {
        warn!(error = %e, "failed to start metrics exporter, continuing without it");
    }

    let ssh = SshSessionManager::new(args.ssh_config());
    if let Err(e) = ssh.connect().await {
        warn!(error = %e, "initial appliance connection failed, reconnect loop will retry");
    }
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(ssh.clone().reconnect_loop(shutdown_rx));

    let appliance = Arc::new(ApplianceClient::new(ssh));

    // No concrete cluster-API client exists for either of these; the
    // in-memory stores are the pragmatic placeholder until this driver is
    // wired against a real orchestrator integration (see DESIGN.md).
    let record_store = Arc::new(InMemoryClusterRecordStore::new());
    let volume_store = Arc::new(InMemoryClusterVolumeStore::new());

    let attachment = Arc::new(AttachmentManager::new(
        node_id.clone(),
        args.migration_window(),
        record_store,
    ));

    let readiness = Arc::new(ReadinessState::new());
    let identity_service = IdentityService::new(readiness.clone());

    let snapshots = Arc::new(SnapshotEngine::new(appliance.clone(), args.appliance_base_path.clone()));

    let controller_service = ControllerService::new(
        appliance.clone(),
        attachment.clone(),
        snapshots,
        args.nqn_prefix.clone(),
        args.appliance_storage_ip.clone(),
        args.nvme_port,
        args.appliance_base_path.clone(),
    );

    let reconciler = Arc::new(OrphanReconciler::new(
        appliance,
        volume_store,
        "pvc-".to_string(),
        args.appliance_base_path.clone(),
        args.reconciler_grace(),
        args.reconciler_dry_run,
    ));
    tokio::spawn(reconciler.run_loop(args.reconciler_interval()));

    match attachment.initialize().await {
        Ok(()) => {
            info!("attachment state rebuilt from cluster records");
            readiness.set_ready(true);
        }
        Err(e) => {
            warn!(error = %e, "attachment state rebuild failed, serving as not-ready");
        }
    }

    let socket_path = args.endpoint.strip_prefix("unix://").unwrap_or(&args.endpoint);
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
        .add_service(ControllerServer::new(controller_service))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await?;

    Ok(())
}
