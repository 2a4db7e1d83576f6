//! Event-bus subscriber multimap.
//!
//! Maps an event-bus address to the set of subscriber endpoints across
//! the cluster. There is no native multimap in the store, so the node id
//! is folded into the key: `<map>/<address>/<nodeId>`, one key per
//! (address, node). Every entry is written with the node's session
//! acquired, which makes the whole registry self-cleaning: a node dying
//! takes every subscription it held with it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use corral_proto::catalog::PutOptions;
use corral_proto::codec::Codec;
use corral_proto::error::{CoordError, CoordResult};
use corral_proto::keys::{address_prefix, sub_key, sub_owner};
use corral_proto::node::SubscriberInfo;

use crate::gateway::KvGateway;
use crate::session::SessionManager;
use crate::state::StateCell;

/// Set-like container handing out one element per `choose` call via
/// round-robin: the element at `counter mod size`, counter bumped
/// atomically per call. Spreads load uniformly across subscribers with
/// no per-caller state.
pub struct ChoosableSet<V> {
    items: Vec<V>,
    counter: AtomicUsize,
}

impl<V> ChoosableSet<V> {
    pub fn new(items: Vec<V>) -> Self {
        Self {
            items,
            counter: AtomicUsize::new(0),
        }
    }

    /// Next element in round-robin order; `None` when the set is empty.
    pub fn choose(&self) -> Option<&V> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.items.len();
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.items.iter()
    }
}

/// Distributed multimap of event-bus subscribers, entries tied to the
/// subscribing node's session.
pub struct SubsMap {
    name: String,
    node_id: String,
    gateway: KvGateway,
    codec: Arc<dyn Codec<SubscriberInfo>>,
    session: Arc<SessionManager>,
    /// When set, a rejected session write flips the owning node to its
    /// failed state.
    state: Option<Arc<StateCell>>,
}

impl SubsMap {
    pub fn new(
        name: impl Into<String>,
        node_id: impl Into<String>,
        gateway: KvGateway,
        codec: Arc<dyn Codec<SubscriberInfo>>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            name: name.into(),
            node_id: node_id.into(),
            gateway,
            codec,
            session,
            state: None,
        }
    }

    pub fn with_state(mut self, state: Arc<StateCell>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `sub` under `address`, bound to this node's session.
    /// Re-adding overwrites the previous entry for this node. Fails with
    /// [`CoordError::Contention`] when the store denies the acquire.
    pub async fn add(&self, address: &str, sub: &SubscriberInfo) -> CoordResult<()> {
        let session_id = self.session.require_session()?;
        let bytes = self.codec.encode(sub)?;
        let key = sub_key(&self.name, address, &self.node_id);
        let applied = match self
            .gateway
            .put(&key, bytes, PutOptions::acquire(session_id))
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                if e.is_session_loss() {
                    if let Some(state) = &self.state {
                        state.mark_failed();
                    }
                }
                return Err(e);
            }
        };
        if !applied {
            return Err(CoordError::Contention);
        }
        debug!("subs {}: added {} under {}", self.name, sub, address);
        Ok(())
    }

    /// Every subscriber currently registered under `address`, as a
    /// round-robin choosable set. Entries that fail to decode are skipped.
    pub async fn get(&self, address: &str) -> CoordResult<ChoosableSet<SubscriberInfo>> {
        let entries = self
            .gateway
            .list(&address_prefix(&self.name, address))
            .await?;
        let mut subs = Vec::with_capacity(entries.len());
        for pair in entries {
            match self.codec.decode(&pair.value) {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    warn!("subs {}: skipping undecodable {}: {}", self.name, pair.key, e);
                }
            }
        }
        Ok(ChoosableSet::new(subs))
    }

    /// Remove `sub`'s registration under `address`. The key belonging to
    /// the subscriber's own node is deleted only when its stored value
    /// decodes equal to `sub`. Returns `true` iff a key was deleted.
    pub async fn remove(&self, address: &str, sub: &SubscriberInfo) -> CoordResult<bool> {
        let key = sub_key(&self.name, address, &sub.node_id);
        let Some(bytes) = self.gateway.get(&key).await? else {
            return Ok(false);
        };
        match self.codec.decode(&bytes) {
            Ok(stored) if stored == *sub => {
                self.gateway.delete(&key).await?;
                debug!("subs {}: removed {} from {}", self.name, sub, address);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                warn!("subs {}: undecodable {} during remove: {}", self.name, key, e);
                Ok(false)
            }
        }
    }

    /// Delete every entry across the whole map whose decoded value
    /// satisfies `pred`. Deletes run in parallel; the call fails if any
    /// delete fails. Not atomic across keys — a failure part-way leaves
    /// partial deletion, which session cleanup eventually drains.
    pub async fn remove_all_matching<P>(&self, pred: P) -> CoordResult<()>
    where
        P: Fn(&SubscriberInfo) -> bool,
    {
        let entries = self.gateway.list(&format!("{}/", self.name)).await?;
        let mut deletes = JoinSet::new();
        for pair in entries {
            let value = match self.codec.decode(&pair.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        "subs {}: skipping undecodable {} during sweep: {}",
                        self.name, pair.key, e
                    );
                    continue;
                }
            };
            if sub_owner(&pair.key).is_none() {
                continue;
            }
            if pred(&value) {
                let gateway = self.gateway.clone();
                deletes.spawn(async move { gateway.delete(&pair.key).await });
            }
        }
        while let Some(joined) = deletes.join_next().await {
            joined.map_err(|e| CoordError::transport(e.to_string()))??;
        }
        Ok(())
    }

    /// Delete every entry equal to `value` across the whole map.
    pub async fn remove_all_for_value(&self, value: &SubscriberInfo) -> CoordResult<()> {
        self.remove_all_matching(|sub| sub == value).await
    }
}
