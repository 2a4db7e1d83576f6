//! KV gateway.
//!
//! Thin stateless adapter between the components and the coordination
//! agent. Its only jobs are to apply the configured per-call timeout and
//! to keep the rest of the core ignorant of which backend is plugged in.
//! A timed-out call surfaces as a transport failure, same as an
//! unreachable agent.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use corral_proto::catalog::{KvPair, PutOptions};
use corral_proto::error::{CoordError, CoordResult};

use crate::agent::{CoordAgent, KvWatchEvent, WatchHandle};

/// Stateless KV access front for all components.
#[derive(Clone)]
pub struct KvGateway {
    agent: Arc<dyn CoordAgent>,
    call_timeout: Duration,
}

impl KvGateway {
    pub fn new(agent: Arc<dyn CoordAgent>, call_timeout: Duration) -> Self {
        Self {
            agent,
            call_timeout,
        }
    }

    /// The backend this gateway forwards to.
    pub fn agent(&self) -> &Arc<dyn CoordAgent> {
        &self.agent
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = CoordResult<T>>,
    ) -> CoordResult<T> {
        match timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::transport(format!(
                "{} timed out after {:?}",
                what, self.call_timeout
            ))),
        }
    }

    pub async fn get(&self, key: &str) -> CoordResult<Option<Vec<u8>>> {
        self.bounded("kv get", self.agent.kv_get(key)).await
    }

    pub async fn entry(&self, key: &str) -> CoordResult<Option<KvPair>> {
        self.bounded("kv entry", self.agent.kv_entry(key)).await
    }

    pub async fn list(&self, prefix: &str) -> CoordResult<Vec<KvPair>> {
        self.bounded("kv list", self.agent.kv_list(prefix)).await
    }

    /// Returns `true` if the write was applied, `false` if a
    /// compare-and-set lost or an acquire was denied.
    pub async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> CoordResult<bool> {
        self.bounded("kv put", self.agent.kv_put(key, value, opts))
            .await
    }

    pub async fn delete(&self, key: &str) -> CoordResult<()> {
        self.bounded("kv delete", self.agent.kv_delete(key)).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> CoordResult<()> {
        self.bounded("kv delete-prefix", self.agent.kv_delete_prefix(prefix))
            .await
    }

    pub async fn watch_prefix(&self, prefix: &str) -> CoordResult<WatchHandle<KvWatchEvent>> {
        self.bounded("kv watch", self.agent.watch_kv_prefix(prefix))
            .await
    }
}
