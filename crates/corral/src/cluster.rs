//! Cluster facade.
//!
//! Assembles the gateway, session, probe, node manager, multimaps, locks
//! and counters behind one handle and tracks the node's lifetime state.
//! Construction is cheap; nothing touches the agent until `join`. All
//! per-name primitives are singletons: asking twice for the same name
//! returns the same instance.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use corral_proto::codec::{BincodeCodec, Codec};
use corral_proto::error::{CoordError, CoordResult};
use corral_proto::node::SubscriberInfo;

use crate::agent::CoordAgent;
use crate::cache::WatchCache;
use crate::config::CoordConfig;
use crate::counter::DistributedCounter;
use crate::gateway::KvGateway;
use crate::lock::{DistributedLock, LockFactory};
use crate::membership::{MembershipListener, NodeManager};
use crate::state::{NodeState, StateCell};
use crate::submap::SubsMap;

/// One node's handle on the cluster.
pub struct Coordinator {
    node_id: String,
    gateway: KvGateway,
    node_manager: Arc<NodeManager>,
    lock_factory: LockFactory,
    state: Arc<StateCell>,
    sub_codec: Arc<dyn Codec<SubscriberInfo>>,
    subs_maps: DashMap<String, Arc<SubsMap>>,
    counters: DashMap<String, Arc<DistributedCounter>>,
}

impl Coordinator {
    /// Build a coordinator over `agent` with the default subscriber
    /// codec. Does not contact the agent; call [`join`](Self::join).
    pub fn new(agent: Arc<dyn CoordAgent>, config: CoordConfig, node_id: impl Into<String>) -> Self {
        Self::with_codec(agent, config, node_id, Arc::new(BincodeCodec::new()))
    }

    /// Build a coordinator with an injected subscriber codec.
    pub fn with_codec(
        agent: Arc<dyn CoordAgent>,
        config: CoordConfig,
        node_id: impl Into<String>,
        sub_codec: Arc<dyn Codec<SubscriberInfo>>,
    ) -> Self {
        let node_id = node_id.into();
        let gateway = KvGateway::new(agent.clone(), config.kv_timeout);
        let node_manager = Arc::new(NodeManager::new(
            agent.clone(),
            gateway.clone(),
            config.clone(),
            node_id.clone(),
        ));
        let lock_factory = LockFactory::new(
            agent,
            gateway.clone(),
            node_id.clone(),
            config.lock_retry_interval,
        );
        Self {
            node_id,
            gateway,
            node_manager,
            lock_factory,
            state: StateCell::new(),
            sub_codec,
            subs_maps: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current lifetime state.
    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    /// Join the cluster. Allowed once, from the fresh state.
    pub async fn join(&self) -> CoordResult<()> {
        if !self.state.transition(NodeState::New, NodeState::Joining) {
            return Err(CoordError::ShutDown);
        }
        match self.node_manager.join().await {
            Ok(()) => {
                self.state.transition(NodeState::Joining, NodeState::Active);
                info!("cluster: {} active", self.node_id);
                Ok(())
            }
            Err(e) => {
                self.state.mark_failed();
                Err(e)
            }
        }
    }

    /// Leave the cluster with ordered best-effort teardown.
    pub async fn leave(&self) -> CoordResult<()> {
        if !self.state.transition(NodeState::Active, NodeState::Leaving) {
            return Err(CoordError::ShutDown);
        }
        self.node_manager.leave().await;
        self.state.transition(NodeState::Leaving, NodeState::Stopped);
        info!("cluster: {} stopped", self.node_id);
        Ok(())
    }

    /// Snapshot of the membership view, self included.
    pub fn members(&self) -> HashSet<String> {
        self.node_manager.members()
    }

    /// Install the membership listener.
    pub fn set_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.node_manager.set_listener(listener);
    }

    /// The subscriber multimap named `name`; a singleton per name.
    pub fn subs_map(&self, name: &str) -> Arc<SubsMap> {
        self.subs_maps
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    SubsMap::new(
                        name,
                        self.node_id.clone(),
                        self.gateway.clone(),
                        self.sub_codec.clone(),
                        self.node_manager.session().clone(),
                    )
                    .with_state(self.state.clone()),
                )
            })
            .clone()
    }

    /// The distributed counter named `name`; a singleton per name.
    pub fn counter(&self, name: &str) -> Arc<DistributedCounter> {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DistributedCounter::new(name, self.gateway.clone())))
            .clone()
    }

    /// Try to obtain the exclusive lock `name` within `timeout`.
    pub async fn try_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> CoordResult<Option<DistributedLock>> {
        self.lock_factory.try_lock(name, timeout).await
    }

    /// Local HA-info view: synchronous reads, preloaded at join.
    pub fn ha_info(&self) -> &Arc<WatchCache<Vec<u8>>> {
        self.node_manager.ha_info()
    }

    /// Write an HA-info entry; visible to local reads immediately.
    pub async fn ha_info_put(&self, key: &str, value: Vec<u8>) -> CoordResult<()> {
        self.ha_info().put(key, value).await
    }

    /// Remove an HA-info entry written by this node.
    pub async fn ha_info_remove(&self, key: &str) -> CoordResult<()> {
        self.ha_info().remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LocalAgent;
    use crate::membership::MembershipListener;
    use corral_proto::catalog::CheckStatus;
    use corral_proto::keys::{check_id, SUBS_MAP};
    use std::sync::Mutex;

    fn make_coordinator(agent: Arc<LocalAgent>, node_id: &str) -> Coordinator {
        let config = CoordConfig {
            probe_port_range: (22000, 22200),
            lock_retry_interval: Duration::from_millis(20),
            ..CoordConfig::default()
        };
        Coordinator::new(agent, config, node_id)
    }

    struct CountingListener {
        left: Mutex<Vec<String>>,
    }

    impl MembershipListener for CountingListener {
        fn node_added(&self, _node_id: &str) {}
        fn node_left(&self, node_id: &str) {
            self.left.lock().unwrap().push(node_id.to_string());
        }
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..200 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator = make_coordinator(agent, "a");
        assert_eq!(coordinator.state(), NodeState::New);

        coordinator.join().await.unwrap();
        assert_eq!(coordinator.state(), NodeState::Active);
        assert_eq!(coordinator.members().len(), 1);

        coordinator.leave().await.unwrap();
        assert_eq!(coordinator.state(), NodeState::Stopped);

        // Terminal: neither join nor leave work any more.
        assert!(coordinator.join().await.is_err());
        assert!(coordinator.leave().await.is_err());
    }

    #[tokio::test]
    async fn test_primitives_are_singletons_per_name() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator = make_coordinator(agent, "a");
        coordinator.join().await.unwrap();

        assert!(Arc::ptr_eq(
            &coordinator.subs_map(SUBS_MAP),
            &coordinator.subs_map(SUBS_MAP)
        ));
        assert!(Arc::ptr_eq(
            &coordinator.counter("hits"),
            &coordinator.counter("hits")
        ));
        assert!(!Arc::ptr_eq(
            &coordinator.counter("hits"),
            &coordinator.counter("misses")
        ));
        coordinator.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_dirty_peer_death_evacuates_subs_and_notifies() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator_a = make_coordinator(agent.clone(), "a");
        let listener = Arc::new(CountingListener {
            left: Mutex::new(Vec::new()),
        });
        coordinator_a.set_listener(listener.clone());
        coordinator_a.join().await.unwrap();

        let coordinator_b = make_coordinator(agent.clone(), "b");
        coordinator_b.join().await.unwrap();
        wait_until(|| coordinator_a.members().len() == 2).await;

        let subs_b = coordinator_b.subs_map(SUBS_MAP);
        subs_b
            .add("orders", &SubscriberInfo::new("b", "127.0.0.1", 5502))
            .await
            .unwrap();

        // B's process dies; the agent's probe goes critical.
        agent
            .set_check_status(&check_id("b"), CheckStatus::Critical)
            .await
            .unwrap();

        wait_until(|| coordinator_a.members().len() == 1).await;
        wait_until(|| !listener.left.lock().unwrap().is_empty()).await;
        assert_eq!(listener.left.lock().unwrap().clone(), vec!["b".to_string()]);

        // Every subscription B held is gone.
        let subs = coordinator_a
            .subs_map(SUBS_MAP)
            .get("orders")
            .await
            .unwrap();
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_lock_contention_across_nodes() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator_a = make_coordinator(agent.clone(), "a");
        let coordinator_b = make_coordinator(agent.clone(), "b");
        coordinator_a.join().await.unwrap();
        coordinator_b.join().await.unwrap();

        let (first, second) = tokio::join!(
            coordinator_a.try_lock("L", Duration::from_millis(300)),
            coordinator_b.try_lock("L", Duration::from_millis(300)),
        );
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(first.is_some() ^ second.is_some());

        first.or(second).unwrap().release().await.unwrap();
        let retaken = coordinator_a
            .try_lock("L", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(retaken.is_some());
    }

    #[tokio::test]
    async fn test_lock_survivor_takes_over_after_holder_death() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator_a = make_coordinator(agent.clone(), "a");
        let coordinator_b = make_coordinator(agent.clone(), "b");
        coordinator_a.join().await.unwrap();
        coordinator_b.join().await.unwrap();

        let _held = coordinator_a
            .try_lock("L", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        agent
            .set_check_status(&check_id("a"), CheckStatus::Critical)
            .await
            .unwrap();

        let takeover = coordinator_b
            .try_lock("L", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(takeover.is_some());
    }

    #[tokio::test]
    async fn test_session_invalidation_fails_the_facade() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator = make_coordinator(agent.clone(), "a");
        coordinator.join().await.unwrap();

        // The session dies underneath the node (agent-side invalidation)
        // without the catalog changing.
        let session_id = coordinator.node_manager.session().session_id().unwrap();
        agent.destroy_session(&session_id).await.unwrap();

        let subs = coordinator.subs_map(SUBS_MAP);
        let err = subs
            .add("addr", &SubscriberInfo::new("a", "127.0.0.1", 5501))
            .await
            .unwrap_err();
        assert!(err.is_session_loss());
        assert_eq!(coordinator.state(), NodeState::Failed);

        // A failed facade refuses lifecycle operations.
        assert!(coordinator.leave().await.is_err());
    }

    #[tokio::test]
    async fn test_ha_info_read_your_writes() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator = make_coordinator(agent, "a");
        coordinator.join().await.unwrap();

        coordinator
            .ha_info_put("deployments", b"v2".to_vec())
            .await
            .unwrap();
        assert_eq!(
            coordinator.ha_info().get("deployments").as_deref(),
            Some(b"v2".as_slice())
        );

        coordinator.ha_info_remove("deployments").await.unwrap();
        assert!(coordinator.ha_info().get("deployments").is_none());
        coordinator.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_counters_converge_across_nodes() {
        let agent = Arc::new(LocalAgent::new());
        let coordinator_a = make_coordinator(agent.clone(), "a");
        let coordinator_b = make_coordinator(agent.clone(), "b");
        coordinator_a.join().await.unwrap();
        coordinator_b.join().await.unwrap();

        assert_eq!(coordinator_a.counter("c").increment_and_get().await.unwrap(), 1);
        assert_eq!(coordinator_b.counter("c").increment_and_get().await.unwrap(), 2);
        assert_eq!(coordinator_a.counter("c").get().await.unwrap(), 2);
    }
}
