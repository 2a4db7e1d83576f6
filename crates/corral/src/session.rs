//! Node session management.
//!
//! Each node owns exactly one session for its lifetime. The session is
//! created with DELETE behavior and bound to the node's TCP liveness
//! check plus the agent's own gossip health check, so that a node going
//! unreachable wipes every ephemeral key it ever acquired without the
//! node's participation.

use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use corral_proto::catalog::{SessionBehavior, SessionRecord};
use corral_proto::error::{CoordError, CoordResult};
use corral_proto::keys::{session_name, SERF_HEALTH_CHECK};

use crate::agent::CoordAgent;

/// Creates and destroys the node session; caches the current id.
pub struct SessionManager {
    agent: Arc<dyn CoordAgent>,
    node_id: String,
    /// Written once per node lifetime, read freely.
    session_id: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new(agent: Arc<dyn CoordAgent>, node_id: impl Into<String>) -> Self {
        Self {
            agent,
            node_id: node_id.into(),
            session_id: RwLock::new(None),
        }
    }

    /// Create the node session bound to `check_id` and the agent's gossip
    /// health check. Returns the new session id, which is also cached.
    pub async fn register(&self, check_id: &str) -> CoordResult<String> {
        let record = SessionRecord {
            name: session_name(&self.node_id),
            checks: vec![check_id.to_string(), SERF_HEALTH_CHECK.to_string()],
            behavior: SessionBehavior::Delete,
        };
        let session_id = self.agent.create_session(record).await?;
        info!(
            "session: {} registered for node {}",
            session_id, self.node_id
        );
        *self.session_id.write().unwrap() = Some(session_id.clone());
        Ok(session_id)
    }

    /// Current session id. Never empty after a successful
    /// [`register`](Self::register).
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().unwrap().clone()
    }

    /// Like [`session_id`](Self::session_id) but failing when no session
    /// exists, for write paths that must carry one.
    pub fn require_session(&self) -> CoordResult<String> {
        self.session_id().ok_or(CoordError::NoSession)
    }

    /// Destroy the node session. Unconditional and idempotent; a failure
    /// is reported but the cached id is cleared regardless, because the
    /// agent will reap the session through its checks anyway.
    pub async fn destroy(&self) -> CoordResult<()> {
        let current = self.session_id.write().unwrap().take();
        let Some(session_id) = current else {
            debug!("session: nothing to destroy for node {}", self.node_id);
            return Ok(());
        };
        match self.agent.destroy_session(&session_id).await {
            Ok(()) => {
                info!("session: {} destroyed", session_id);
                Ok(())
            }
            Err(e) => {
                warn!("session: failed to destroy {}: {}", session_id, e);
                Err(e)
            }
        }
    }
}
