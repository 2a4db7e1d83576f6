//! Coordination-agent seam.
//!
//! Everything the core needs from a Consul-style agent is expressed as one
//! async trait so that backends can be swapped transparently: a KV store
//! with session-acquire and compare-and-set writes, prefix watches that
//! deliver (previous, next) snapshot pairs, a service catalog with a
//! catalog watch, TCP liveness checks, and sessions whose invalidation
//! deletes every key acquired under them.
//!
//! One implementation is provided:
//! - `local`: single-process agent for testing/development. It implements
//!   the full session/check/watch semantics without any networking.
//!
//! A backend speaking a real agent's HTTP API is a further implementation
//! of the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use corral_proto::catalog::{
    CheckRecord, CheckStatus, KvPair, PutOptions, ServiceRecord, SessionRecord,
};
use corral_proto::error::CoordResult;

pub mod local;

pub use local::LocalAgent;

/// Flat unordered snapshot of every key under a watched prefix.
pub type KvSnapshot = HashMap<String, Vec<u8>>;

/// One delivery of a KV prefix watch: the snapshot before and after a
/// change.
#[derive(Debug, Clone, Default)]
pub struct KvWatchEvent {
    pub prev: KvSnapshot,
    pub next: KvSnapshot,
}

/// One delivery of the service-catalog watch.
#[derive(Debug, Clone, Default)]
pub struct ServiceWatchEvent {
    pub prev: Vec<ServiceRecord>,
    pub next: Vec<ServiceRecord>,
}

/// Receiving half of a watch subscription.
///
/// Deliveries for one handle are serialized: the agent emits events in
/// mutation order and the consumer drains them one at a time. Dropping
/// the handle cancels the watch; the agent prunes the subscription on the
/// next emission.
pub struct WatchHandle<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> WatchHandle<E> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<E>) -> Self {
        Self { rx }
    }

    /// Next delivery, or `None` once the agent side has shut down.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }
}

/// Trait that all coordination-agent backends must implement.
///
/// All operations are asynchronous and fail with
/// [`corral_proto::error::CoordError::Transport`] on network or agent
/// failure.
#[async_trait]
pub trait CoordAgent: Send + Sync {
    /// Human-readable name of this backend (e.g. "local").
    fn name(&self) -> &str;

    // ─── KV store ───────────────────────────────────────────────────────

    /// Value under `key`, if present.
    async fn kv_get(&self, key: &str) -> CoordResult<Option<Vec<u8>>>;

    /// Value plus modify index under `key`, for compare-and-set callers.
    async fn kv_entry(&self, key: &str) -> CoordResult<Option<KvPair>>;

    /// Every entry whose key starts with `prefix`.
    async fn kv_list(&self, prefix: &str) -> CoordResult<Vec<KvPair>>;

    /// Write `value` under `key`. Returns `false` when a compare-and-set
    /// lost or a session acquire was denied because another live session
    /// holds the key.
    async fn kv_put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> CoordResult<bool>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn kv_delete(&self, key: &str) -> CoordResult<()>;

    /// Remove every key under `prefix`.
    async fn kv_delete_prefix(&self, prefix: &str) -> CoordResult<()>;

    /// Subscribe to changes under `prefix`.
    async fn watch_kv_prefix(&self, prefix: &str) -> CoordResult<WatchHandle<KvWatchEvent>>;

    // ─── Service catalog ────────────────────────────────────────────────

    /// Upsert a service record.
    async fn register_service(&self, record: ServiceRecord) -> CoordResult<()>;

    /// Remove a service record and its checks.
    async fn deregister_service(&self, service_id: &str) -> CoordResult<()>;

    /// Current catalog contents.
    async fn list_services(&self) -> CoordResult<Vec<ServiceRecord>>;

    /// Subscribe to catalog changes.
    async fn watch_services(&self) -> CoordResult<WatchHandle<ServiceWatchEvent>>;

    // ─── Checks ─────────────────────────────────────────────────────────

    /// Register a TCP liveness check against an existing service.
    async fn register_check(&self, record: CheckRecord) -> CoordResult<()>;

    /// Remove a check. Sessions bound to it are invalidated.
    async fn deregister_check(&self, check_id: &str) -> CoordResult<()>;

    /// Update a check's status. A transition to critical invalidates
    /// bound sessions.
    async fn set_check_status(&self, check_id: &str, status: CheckStatus) -> CoordResult<()>;

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Create a session; returns its id. Every named check must exist.
    async fn create_session(&self, record: SessionRecord) -> CoordResult<String>;

    /// Destroy a session unconditionally. Destroying an unknown or
    /// already-destroyed session is a no-op.
    async fn destroy_session(&self, session_id: &str) -> CoordResult<()>;
}
