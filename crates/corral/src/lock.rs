//! Distributed exclusive locks.
//!
//! Lock state is the existence of a key under the lock prefix, acquired
//! under a session created fresh for each attempt. The session is bound
//! to the node's liveness check, so a node dying with a lock held gives
//! the lock up once the agent invalidates the session. Releasing never
//! touches the key directly: destroying the session makes the store
//! delete the key (DELETE behavior), which both frees the lock and
//! leaves no stale state behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use corral_proto::catalog::{PutOptions, SessionBehavior, SessionRecord};
use corral_proto::error::CoordResult;
use corral_proto::keys::{check_id, lock_session_name, map_key, LOCKS_MAP, LOCK_SENTINEL,
    SERF_HEALTH_CHECK};

use crate::agent::CoordAgent;
use crate::gateway::KvGateway;

/// Creates locks on behalf of one node.
pub struct LockFactory {
    agent: Arc<dyn CoordAgent>,
    gateway: KvGateway,
    node_id: String,
    retry_interval: Duration,
}

impl LockFactory {
    pub fn new(
        agent: Arc<dyn CoordAgent>,
        gateway: KvGateway,
        node_id: impl Into<String>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            agent,
            gateway,
            node_id: node_id.into(),
            retry_interval,
        }
    }

    /// Try to obtain the exclusive lock `name` within `timeout`.
    ///
    /// A fresh session is created for the attempt, bound to this node's
    /// check. On success the held lock is returned; on timeout the
    /// session is destroyed and `None` is returned. Contention inside the
    /// budget is retried on a fixed cadence; the store serializes
    /// acquires, so no in-process coordination is needed.
    pub async fn try_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> CoordResult<Option<DistributedLock>> {
        let deadline = Instant::now() + timeout;
        let session_id = self
            .agent
            .create_session(SessionRecord {
                name: lock_session_name(name, &self.node_id),
                checks: vec![check_id(&self.node_id), SERF_HEALTH_CHECK.to_string()],
                behavior: SessionBehavior::Delete,
            })
            .await?;

        let key = map_key(LOCKS_MAP, name);
        loop {
            let acquired = match self
                .gateway
                .put(&key, LOCK_SENTINEL.to_vec(), PutOptions::acquire(session_id.as_str()))
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    // Attempt abandoned: don't leave the session around.
                    let _ = self.agent.destroy_session(&session_id).await;
                    return Err(e);
                }
            };
            if acquired {
                info!("lock {}: obtained by {}", name, self.node_id);
                return Ok(Some(DistributedLock {
                    agent: self.agent.clone(),
                    name: name.to_string(),
                    session_id,
                    released: AtomicBool::new(false),
                }));
            }
            if Instant::now() + self.retry_interval > deadline {
                debug!("lock {}: timed out for {}", name, self.node_id);
                let _ = self.agent.destroy_session(&session_id).await;
                return Ok(None);
            }
            sleep(self.retry_interval).await;
        }
    }
}

/// A held exclusive lock. Dropping without `release` leaves the lock to
/// be reclaimed when the backing session dies with the node.
pub struct DistributedLock {
    agent: Arc<dyn CoordAgent>,
    name: String,
    session_id: String,
    released: AtomicBool,
}

impl DistributedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock by destroying its session; the store deletes the
    /// lock key, yielding it to waiters. Releasing twice is a no-op.
    pub async fn release(&self) -> CoordResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("lock {}: double release ignored", self.name);
            return Ok(());
        }
        match self.agent.destroy_session(&self.session_id).await {
            Ok(()) => {
                info!("lock {}: released", self.name);
                Ok(())
            }
            Err(e) => {
                warn!("lock {}: release failed: {}", self.name, e);
                Err(e)
            }
        }
    }
}
