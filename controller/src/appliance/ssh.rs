//! SSH transport to the appliance.
//!
//! A single long-lived session multiplexes every CLI command; at most one
//! command is ever in flight. Liveness is probed at a fixed cadence; on
//! loss, a background task reconnects with exponential backoff and jitter,
//! unbounded except by task cancellation. The host key is pinned and
//! re-verified on every connect -- a mismatch is a critical security event
//! and the connection is refused outright.

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use ssh2::Session;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, instrument, warn};

use csi_common::{DriverError, DriverResult};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: PathBuf,
    /// SHA256 host key fingerprint pinned from the mounted secret.
    pub pinned_host_key_sha256: String,
    pub liveness_probe_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    pub backoff_jitter_ratio: f64,
}

struct Inner {
    session: Option<Session>,
    generation: u64,
    alive: bool,
}

pub struct SshSessionManager {
    config: SshConfig,
    inner: StdMutex<Inner>,
    command_lock: AsyncMutex<()>,
    circuit_breaker: CircuitBreaker,
}

impl SshSessionManager {
    pub fn new(config: SshConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: StdMutex::new(Inner {
                session: None,
                generation: 0,
                alive: false,
            }),
            command_lock: AsyncMutex::new(()),
            circuit_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().expect("ssh inner lock poisoned").alive
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("ssh inner lock poisoned").generation
    }

    /// Establish (or re-establish) the SSH session, verifying the pinned
    /// host key. Blocking; callers run this on the blocking pool.
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    pub async fn connect(self: &Arc<Self>) -> DriverResult<()> {
        let config = self.config.clone();
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || this.connect_blocking(&config))
            .await
            .map_err(|e| DriverError::internal(format!("ssh connect task panicked: {e}")))?;
        metrics::record_appliance_connection_attempt(result.is_ok());
        if result.is_err() {
            metrics::set_appliance_connected(false);
        }
        result
    }

    fn connect_blocking(&self, config: &SshConfig) -> DriverResult<()> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
            DriverError::unavailable(format!(
                "failed to reach appliance {}:{}: {e}",
                config.host, config.port
            ))
        })?;
        tcp.set_nodelay(true).ok();

        let mut session = Session::new()
            .map_err(|e| DriverError::internal(format!("failed to create ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| DriverError::unavailable(format!("ssh handshake failed: {e}")))?;

        self.verify_host_key(&session, config)?;

        session
            .userauth_pubkey_file(&config.username, None, &config.private_key_path, None)
            .map_err(|e| {
                DriverError::unavailable(format!("ssh key authentication failed: {e}"))
            })?;
        if !session.authenticated() {
            return Err(DriverError::unavailable(
                "ssh authentication did not complete",
            ));
        }

        let mut inner = self.inner.lock().expect("ssh inner lock poisoned");
        inner.session = Some(session);
        inner.alive = true;
        inner.generation += 1;
        info!(generation = inner.generation, "ssh session established");
        metrics::set_appliance_connected(true);
        Ok(())
    }

    /// Verify the live host key fingerprint matches the pinned one from the
    /// mounted secret. A mismatch is treated as a potential MITM and the
    /// connection is refused -- never silently trusted or auto-updated.
    fn verify_host_key(&self, session: &Session, config: &SshConfig) -> DriverResult<()> {
        let (_key, _key_type) = session.host_key().ok_or_else(|| {
            DriverError::internal("appliance did not present a host key".to_string())
        })?;
        let fingerprint = session
            .host_key_hash(ssh2::HashType::Sha256)
            .map(|bytes| {
                bytes
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<String>()
            })
            .ok_or_else(|| DriverError::internal("failed to compute host key fingerprint"))?;

        if fingerprint != config.pinned_host_key_sha256 {
            error!(
                expected = %config.pinned_host_key_sha256,
                actual = %fingerprint,
                "appliance host key does not match pinned fingerprint -- refusing connection"
            );
            return Err(DriverError::unavailable(
                "appliance host key mismatch: refusing to connect",
            ));
        }
        Ok(())
    }

    /// Run a single CLI command through the circuit breaker, serialized
    /// against every other in-flight command.
    #[instrument(skip(self, command), fields(generation = self.generation()))]
    pub async fn run_command(self: &Arc<Self>, command: &str) -> DriverResult<String> {
        let _permit = self.command_lock.lock().await;
        let command = command.to_string();
        let this = self.clone();

        self.circuit_breaker
            .call(async move { this.exec_blocking(command).await })
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open => {
                    DriverError::unavailable("appliance circuit breaker is open")
                }
                CircuitBreakerError::Inner(inner) => inner,
            })
    }

    async fn exec_blocking(self: &Arc<Self>, command: String) -> DriverResult<String> {
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || this.exec_once(&command))
            .await
            .map_err(|e| DriverError::internal(format!("ssh exec task panicked: {e}")))?;

        match result {
            Ok(output) => Ok(output),
            Err(err) => {
                warn!(error = %err, "ssh command failed, marking session dead");
                self.inner.lock().expect("ssh inner lock poisoned").alive = false;
                metrics::set_appliance_connected(false);
                Err(err)
            }
        }
    }

    fn exec_once(&self, command: &str) -> DriverResult<String> {
        let mut inner = self.inner.lock().expect("ssh inner lock poisoned");
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| DriverError::unavailable("ssh session not established"))?;

        let mut channel = session
            .channel_session()
            .map_err(|e| DriverError::unavailable(format!("failed to open ssh channel: {e}")))?;
        channel
            .exec(command)
            .map_err(|e| DriverError::unavailable(format!("failed to exec command: {e}")))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| DriverError::unavailable(format!("failed to read command output: {e}")))?;
        channel.wait_close().ok();

        let exit_status = channel.exit_status().unwrap_or(-1);
        if exit_status != 0 {
            return Err(DriverError::internal(format!(
                "appliance command exited {exit_status}: {output}"
            )));
        }
        Ok(output)
    }

    /// Background reconnection loop. Runs until `shutdown` fires.
    /// Backoff is unbounded except by that cancellation.
    pub async fn reconnect_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut delay = self.config.backoff_base;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ssh reconnect loop shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.config.liveness_probe_interval) => {}
            }

            if *shutdown.borrow() {
                return;
            }

            if self.is_alive() {
                continue;
            }

            warn!(delay = ?delay, "ssh session not alive, attempting reconnect");
            match self.connect().await {
                Ok(()) => {
                    info!("ssh reconnect succeeded");
                    delay = self.config.backoff_base;
                }
                Err(e) => {
                    error!(error = %e, "ssh reconnect failed");
                    let jitter_span = delay.as_secs_f64() * self.config.backoff_jitter_ratio;
                    let jitter = rand::rng().random_range(-jitter_span..=jitter_span);
                    let slept = (delay.as_secs_f64() + jitter).max(0.0);
                    tokio::time::sleep(Duration::from_secs_f64(slept)).await;
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.config.backoff_factor)
                            .min(self.config.backoff_cap.as_secs_f64()),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SshConfig {
        SshConfig {
            host: "127.0.0.1".to_string(),
            port: 22,
            username: "admin".to_string(),
            private_key_path: PathBuf::from("/secrets/id_ed25519"),
            pinned_host_key_sha256: "deadbeef".to_string(),
            liveness_probe_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
            backoff_cap: Duration::from_secs(60),
            backoff_jitter_ratio: 0.1,
        }
    }

    #[tokio::test]
    async fn new_session_manager_starts_not_alive() {
        let manager = SshSessionManager::new(test_config());
        assert!(!manager.is_alive());
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn commands_fail_fast_without_a_session() {
        let manager = SshSessionManager::new(test_config());
        let result = manager.run_command("/disk print detail").await;
        assert!(result.is_err());
    }
}
