//! # Relay
//!
//! Top-level lifecycle: open one port pair per stored credential, keep
//! picking up new credentials, and tear everything down on shutdown.
//!
//! ## Per Pair
//!
//! | Socket | Port | Role |
//! |--------|------|------|
//! | UDP + TCP | `port1` | user |
//! | UDP + TCP | `port2` | engineer |
//!
//! Each pair gets a [`PairRouter`] actor plus four listener tasks sharing a
//! `watch` shutdown signal.
//!
//! ## Failure Policy
//!
//! Failing to bind a pair at startup is fatal. The same failure during a
//! periodic reload is logged and retried on the next reload.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::crypto::load_tls_acceptor;
use crate::record::KeyRecord;
use crate::router::{PairRouter, RouterConfig};
use crate::signing::SigningKey;
use crate::slots::{PairStatus, Role, UserSlotPolicy};
use crate::store::{CredentialStore, KvBackend, StoreHandle};
use crate::transport::{bind_tcp, bind_udp, run_tcp_listener, run_udp_listener};

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_MAX_ENGINEERS: usize = 8;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address every pair's sockets bind to.
    pub bind: IpAddr,
    /// Engineer slots per pair, across all transports.
    pub max_engineers: usize,
    /// Slots with no traffic for this long are closed.
    pub idle_timeout: Duration,
    pub user_policy: UserSlotPolicy,
    /// How often the store is rescanned for new pairs.
    pub reload_interval: Duration,
    /// PEM certificate chain enabling secure WebSocket.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND,
            max_engineers: DEFAULT_MAX_ENGINEERS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            user_policy: UserSlotPolicy::default(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl RelayConfig {
    fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_engineers: self.max_engineers,
            idle_timeout: self.idle_timeout,
            user_policy: self.user_policy,
        }
    }
}

// ============================================================================
// Port Pair
// ============================================================================

struct PortPair {
    router: PairRouter,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Validated ports of a record; `None` when either does not fit a u16 or is 0.
fn pair_ports(record: &KeyRecord) -> Option<(u16, u16)> {
    let port1 = u16::try_from(record.port1).ok().filter(|&p| p != 0)?;
    let port2 = u16::try_from(record.port2).ok().filter(|&p| p != 0)?;
    (port1 != port2).then_some((port1, port2))
}

// ============================================================================
// Relay
// ============================================================================

pub struct Relay {
    config: RelayConfig,
    store: StoreHandle,
    tls: Option<TlsAcceptor>,
    /// Open pairs keyed by port2.
    pairs: HashMap<u16, PortPair>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("pairs", &self.pairs.len())
            .finish()
    }
}

impl Relay {
    /// Open every stored pair. Any bind failure aborts startup.
    pub async fn start<B: KvBackend + 'static>(
        store: CredentialStore<B>,
        config: RelayConfig,
    ) -> Result<Self> {
        info!("Opening sockets");

        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => anyhow::bail!("secure WebSocket needs both a certificate and a private key"),
        };

        let store = StoreHandle::spawn(store).context("failed to start store thread")?;
        let mut relay = Self { config, store, tls, pairs: HashMap::new() };

        let records = relay.store.load_all().await.context("failed to read key database")?;
        for record in &records {
            relay.open_pair(record).await?;
        }
        info!(count = relay.pairs.len(), "Added {} ports", relay.pairs.len());
        Ok(relay)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Open `(port1, port2)` of every pair, sorted by port2.
    pub fn ports(&self) -> Vec<(u16, u16)> {
        let mut ports: Vec<(u16, u16)> = self
            .pairs
            .values()
            .map(|p| (p.router.port1(), p.router.port2()))
            .collect();
        ports.sort_by_key(|&(_, port2)| port2);
        ports
    }

    pub async fn status(&self, port2: u16) -> Option<PairStatus> {
        self.pairs.get(&port2)?.router.status().await
    }

    /// Open pairs for records added since the last scan. Returns how many
    /// were opened.
    pub async fn reload(&mut self) -> Result<usize> {
        let records = self.store.load_all().await.context("failed to read key database")?;
        let mut added = 0;
        for record in &records {
            match self.open_pair(record).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!(port2 = record.port2, error = format!("{e:#}"), "failed to add port pair"),
            }
        }
        if added > 0 {
            info!(count = added, "Added {} ports", added);
        }
        Ok(added)
    }

    /// Returns `Ok(false)` when the pair is already open or has unusable ports.
    async fn open_pair(&mut self, record: &KeyRecord) -> Result<bool> {
        let Some((port1, port2)) = pair_ports(record) else {
            debug!(port1 = record.port1, port2 = record.port2, "skipping record with unusable ports");
            return Ok(false);
        };
        if self.pairs.contains_key(&port2) {
            return Ok(false);
        }

        let addr1 = SocketAddr::new(self.config.bind, port1);
        let addr2 = SocketAddr::new(self.config.bind, port2);
        let udp1 = bind_udp(addr1)
            .await
            .with_context(|| format!("[{port2}] Failed to open UDP port {port1}"))?;
        let udp2 = bind_udp(addr2)
            .await
            .with_context(|| format!("[{port2}] Failed to open UDP port {port2}"))?;
        let tcp1 = bind_tcp(addr1).with_context(|| format!("[{port2}] Failed to open port {port1}"))?;
        let tcp2 = bind_tcp(addr2).with_context(|| format!("[{port2}] Failed to open port {port2}"))?;

        let key = SigningKey::from_record(record);
        let router = PairRouter::spawn(port1, port2, key, self.store.clone(), self.config.router_config());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(run_udp_listener(Arc::new(udp1), Role::User, router.clone(), shutdown_rx.clone())),
            tokio::spawn(run_udp_listener(Arc::new(udp2), Role::Engineer, router.clone(), shutdown_rx.clone())),
            tokio::spawn(run_tcp_listener(tcp1, Role::User, router.clone(), self.tls.clone(), shutdown_rx.clone())),
            tokio::spawn(run_tcp_listener(tcp2, Role::Engineer, router.clone(), self.tls.clone(), shutdown_rx)),
        ];

        info!(port1, port2, name = %record.name, "Added port {}/{}", port1, port2);
        self.pairs.insert(port2, PortPair { router, shutdown, tasks });
        Ok(true)
    }

    /// Serve until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, exiting gracefully");
        })
        .await
    }

    /// Serve, rescanning the store periodically, until `stop` completes.
    pub async fn run_until<F: Future<Output = ()>>(mut self, stop: F) -> Result<()> {
        let mut reload = tokio::time::interval(self.config.reload_interval);
        reload.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        reload.tick().await;
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = reload.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!(error = format!("{e:#}"), "port reload failed");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close every listener and slot, then flush pending store writes.
    pub async fn shutdown(self) {
        for pair in self.pairs.values() {
            let _ = pair.shutdown.send(true);
        }
        for (_, pair) in self.pairs {
            pair.router.quit().await;
            for task in pair.tasks {
                let _ = task.await;
            }
        }
        self.store.quit().await;
        debug!("relay stopped");
    }
}
