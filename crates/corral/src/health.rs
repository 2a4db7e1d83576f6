//! TCP health probe.
//!
//! The agent's periodic TCP probe is the authoritative liveness signal
//! for a node; the local listener only has to accept the connection. So
//! the probe is a trivial accept-and-close server on a port picked by
//! opportunistic bind from a configured range, plus a check record that
//! tells the agent to dial that port every interval. When the check stays
//! critical long enough, the agent deregisters it and invalidates the
//! sessions bound to it, wiping the node's ephemeral footprint.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use corral_proto::catalog::{CheckRecord, CheckStatus};
use corral_proto::error::{CoordError, CoordResult, JoinStep};
use corral_proto::keys::check_id;

use crate::agent::CoordAgent;
use crate::config::CoordConfig;

/// Accept-and-close listener plus the agent-side check probing it.
pub struct HealthProbe {
    agent: Arc<dyn CoordAgent>,
    config: CoordConfig,
    node_id: String,
    check_id: String,
    addr: RwLock<Option<SocketAddr>>,
    shutdown: Arc<Notify>,
}

impl HealthProbe {
    pub fn new(agent: Arc<dyn CoordAgent>, config: CoordConfig, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let check_id = check_id(&node_id);
        Self {
            agent,
            config,
            node_id,
            check_id,
            addr: RwLock::new(None),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Id of the check guarding this node.
    pub fn check_id(&self) -> &str {
        &self.check_id
    }

    /// Address the listener is bound to; `None` before `start_listener`.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.read().unwrap()
    }

    /// Bind the listener on a free port from the configured range.
    async fn bind_in_range(&self) -> CoordResult<TcpListener> {
        let (lo, hi) = self.config.probe_port_range;
        for port in lo..=hi {
            match TcpListener::bind((self.config.bind_host.as_str(), port)).await {
                Ok(listener) => return Ok(listener),
                Err(_) => continue,
            }
        }
        Err(CoordError::join(
            JoinStep::AllocatePort,
            format!("no free port in {}..={}", lo, hi),
        ))
    }

    /// Bind the listener and start the accept loop. The accept itself is
    /// the health signal; connections are closed immediately.
    pub async fn start_listener(&self) -> CoordResult<SocketAddr> {
        let listener = self.bind_in_range().await?;
        let addr = listener
            .local_addr()
            .map_err(|e| CoordError::join(JoinStep::StartListener, e.to_string()))?;
        info!("probe: listening on {}", addr);
        *self.addr.write().unwrap() = Some(addr);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("probe: listener on {} shutting down", addr);
                        break;
                    }
                    accept = listener.accept() => {
                        match accept {
                            Ok((_stream, peer)) => {
                                // Dropping the stream closes it; that is
                                // the whole acknowledgement.
                                debug!("probe: heartbeat from {}", peer);
                            }
                            Err(e) => {
                                warn!("probe: accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Register the TCP check against this node's service record. Must be
    /// called after `start_listener`.
    pub async fn register_check(&self) -> CoordResult<()> {
        let addr = self
            .addr()
            .ok_or_else(|| CoordError::join(JoinStep::RegisterCheck, "listener not started"))?;
        let record = CheckRecord {
            id: self.check_id.clone(),
            service_id: self.node_id.clone(),
            host: addr.ip().to_string(),
            port: addr.port(),
            interval: self.config.check_interval,
            deregister_after: self.config.deregister_after,
            initial_status: CheckStatus::Passing,
        };
        self.agent.register_check(record).await?;
        info!("probe: check {} registered for {}", self.check_id, addr);
        Ok(())
    }

    /// Remove the check from the agent.
    pub async fn deregister_check(&self) -> CoordResult<()> {
        let result = self.agent.deregister_check(&self.check_id).await;
        if let Err(e) = &result {
            warn!("probe: failed to deregister check {}: {}", self.check_id, e);
        }
        result
    }

    /// Stop the accept loop and release the port. The notify permit is
    /// stored, so stopping a listener that has not been polled yet still
    /// takes effect.
    pub fn stop_listener(&self) {
        self.shutdown.notify_one();
        *self.addr.write().unwrap() = None;
    }
}
