//! The proxy server: listener loop, per-client sessions, dual dispatch.

pub mod cluster;
pub mod dispatcher;
pub mod session;

pub use cluster::{ClusterConnector, ClusterHealth, ClusterKind};
pub use dispatcher::Dispatcher;
pub use session::{ClientSession, SessionShared};

use crate::config::Config;
use crate::error::Result;
use crate::observability::ProxyMetrics;
use crate::statement::{PreparedStatementCache, SystemNonceSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Gemino proxy instance: one listener, one prepared-statement cache, and
/// shared health state for the two upstream clusters.
pub struct Proxy {
    shared: Arc<SessionShared>,
    shutdown: CancellationToken,
    active_clients: Arc<AtomicUsize>,
}

impl Proxy {
    pub fn new(config: Config) -> Proxy {
        let config = Arc::new(config);
        let shared = Arc::new(SessionShared {
            cache: Arc::new(PreparedStatementCache::new(config.proxy.prepared_cache_max)),
            metrics: Arc::new(ProxyMetrics::new()),
            nonces: Arc::new(SystemNonceSource::new()),
            origin_health: Arc::new(ClusterHealth::new(
                ClusterKind::Origin,
                config.heartbeat.failure_threshold,
            )),
            target_health: Arc::new(ClusterHealth::new(
                ClusterKind::Target,
                config.heartbeat.failure_threshold,
            )),
            config,
        });
        Proxy {
            shared,
            shutdown: CancellationToken::new(),
            active_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Token that cascades shutdown to every session and upstream
    /// connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the proxy until the shutdown token fires, then drain sessions
    /// for the configured grace period.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.shared.config.proxy.listen_address).await?;
        self.serve(listener).await
    }

    /// Serve an already-bound listener; `run` is the usual entry point.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let config = &self.shared.config;
        info!(
            "gemino listening on {} (origin {}, target {})",
            config.proxy.listen_address, config.origin.address, config.target.address
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if self.active_clients.load(Ordering::Acquire)
                        >= config.proxy.max_clients_threshold
                    {
                        warn!("refusing client {}: client cap reached", addr);
                        self.shared.metrics.clients_rejected.inc();
                        drop(stream);
                        continue;
                    }

                    debug!("client connected: {}", addr);
                    self.active_clients.fetch_add(1, Ordering::AcqRel);
                    self.shared.metrics.client_connections.inc();

                    let session = ClientSession::new(
                        Arc::clone(&self.shared),
                        addr.to_string(),
                        &self.shutdown,
                    );
                    let metrics = Arc::clone(&self.shared.metrics);
                    let active = Arc::clone(&self.active_clients);
                    tokio::spawn(async move {
                        if let Err(e) = session.handle(stream).await {
                            error!("client {} session error: {}", addr, e);
                        }
                        metrics.client_connections.dec();
                        active.fetch_sub(1, Ordering::AcqRel);
                        debug!("client disconnected: {}", addr);
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }

        // Sessions observe the cancelled token; give their in-flight
        // requests a bounded window to drain.
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(config.proxy.shutdown_grace_ms);
        while self.active_clients.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("gemino stopped");
        Ok(())
    }
}
