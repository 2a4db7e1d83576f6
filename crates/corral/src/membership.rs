//! Node lifecycle and membership.
//!
//! Orchestrates join and leave, owns the authoritative local view of the
//! member set, and keeps that view current through a watch on the service
//! catalog. A member is exactly a service record carrying the clustering
//! tag; the id doubles as the node id.
//!
//! ## Join
//!
//! Join is a linear pipeline, each step awaiting the previous:
//! allocate a probe port, start the probe listener, register the tagged
//! service, register the liveness check, create the session, list tagged
//! peers to seed the member set (self included), preload the HA-info
//! snapshot, start the catalog watcher. A failing step rolls back what
//! came before (best effort) and surfaces which step died. The whole
//! pipeline runs under one deadline; missing it tears down like a leave.
//!
//! ## Listener callouts
//!
//! `node_added`/`node_left` callouts run on a dedicated notifier task fed
//! by a channel, never on the watch-delivery task, so a slow listener
//! cannot stall catalog processing.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use corral_proto::catalog::ServiceRecord;
use corral_proto::codec::BytesCodec;
use corral_proto::error::{CoordError, CoordResult, JoinStep};
use corral_proto::keys::HA_INFO_MAP;

use crate::agent::{CoordAgent, ServiceWatchEvent};
use crate::cache::WatchCache;
use crate::config::CoordConfig;
use crate::gateway::KvGateway;
use crate::health::HealthProbe;
use crate::session::SessionManager;

/// Receives membership change events. Callouts happen off the watch
/// delivery context and may block briefly, but should not run long.
pub trait MembershipListener: Send + Sync {
    fn node_added(&self, node_id: &str);
    fn node_left(&self, node_id: &str);
}

enum MemberEvent {
    Added(String),
    Left(String),
}

/// Join/leave orchestration plus the local membership view.
pub struct NodeManager {
    agent: Arc<dyn CoordAgent>,
    config: CoordConfig,
    node_id: String,
    session: Arc<SessionManager>,
    probe: Arc<HealthProbe>,
    ha_info: Arc<WatchCache<Vec<u8>>>,
    members: Arc<RwLock<HashSet<String>>>,
    listener: Arc<RwLock<Option<Arc<dyn MembershipListener>>>>,
    shutdown: Arc<Notify>,
}

impl NodeManager {
    pub fn new(
        agent: Arc<dyn CoordAgent>,
        gateway: KvGateway,
        config: CoordConfig,
        node_id: impl Into<String>,
    ) -> Self {
        let node_id = node_id.into();
        let session = Arc::new(SessionManager::new(agent.clone(), node_id.clone()));
        let probe = Arc::new(HealthProbe::new(agent.clone(), config.clone(), node_id.clone()));
        let ha_info = Arc::new(WatchCache::new(gateway, HA_INFO_MAP, Arc::new(BytesCodec)));
        Self {
            agent,
            config,
            node_id,
            session,
            probe,
            ha_info,
            members: Arc::new(RwLock::new(HashSet::new())),
            listener: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The node session, shared with components that write ephemeral keys.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// The health probe guarding this node.
    pub fn probe(&self) -> &Arc<HealthProbe> {
        &self.probe
    }

    /// Local HA-info view, preloaded during join and watch-fed afterwards.
    pub fn ha_info(&self) -> &Arc<WatchCache<Vec<u8>>> {
        &self.ha_info
    }

    /// Snapshot of the current membership view, self included.
    pub fn members(&self) -> HashSet<String> {
        self.members.read().unwrap().clone()
    }

    /// Install the membership listener. Events for this node itself are
    /// never delivered.
    pub fn set_listener(&self, listener: Arc<dyn MembershipListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    /// Join the cluster. Completes once this node is a visible,
    /// check-guarded, session-owning member with HA-info preloaded and
    /// the catalog watcher running.
    pub async fn join(&self) -> CoordResult<()> {
        match timeout(self.config.join_timeout, self.join_pipeline()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("membership: join deadline missed, tearing down");
                self.teardown().await;
                Err(CoordError::join(
                    JoinStep::Deadline,
                    format!("join exceeded {:?}", self.config.join_timeout),
                ))
            }
        }
    }

    async fn join_pipeline(&self) -> CoordResult<()> {
        // Steps 1-2: probe endpoint and listener. Errors already name
        // their step.
        let addr = self.probe.start_listener().await?;

        // Step 3: tagged service record makes this node a member.
        let record = ServiceRecord::new(
            &self.node_id,
            &self.node_id,
            vec![self.config.clustering_tag.clone()],
        );
        if let Err(e) = self.agent.register_service(record).await {
            self.teardown().await;
            return Err(CoordError::join(JoinStep::RegisterService, e.to_string()));
        }

        // Step 4: liveness check against the listener.
        if let Err(e) = self.probe.register_check().await {
            self.teardown().await;
            return Err(CoordError::join(JoinStep::RegisterCheck, e.to_string()));
        }

        // Step 5: session bound to the check; ephemeral keys hang off it.
        if let Err(e) = self.session.register(self.probe.check_id()).await {
            self.teardown().await;
            return Err(CoordError::join(JoinStep::RegisterSession, e.to_string()));
        }

        // Step 6: seed the member set from the catalog, self included.
        let services = match self.agent.list_services().await {
            Ok(services) => services,
            Err(e) => {
                self.teardown().await;
                return Err(CoordError::join(JoinStep::DiscoverPeers, e.to_string()));
            }
        };
        let seed: HashSet<String> = services
            .iter()
            .filter(|s| s.has_tag(&self.config.clustering_tag))
            .map(|s| s.id.clone())
            .collect();
        *self.members.write().unwrap() = seed;

        // Step 7: HA-info snapshot must be readable before join returns.
        if let Err(e) = self.ha_info.preload().await {
            self.teardown().await;
            return Err(CoordError::join(JoinStep::PreloadHaInfo, e.to_string()));
        }

        // Step 8: watches keep both views current from here on.
        if let Err(e) = self.ha_info.start_watch().await {
            self.teardown().await;
            return Err(CoordError::join(JoinStep::StartWatcher, e.to_string()));
        }
        if let Err(e) = self.start_watcher().await {
            self.teardown().await;
            return Err(CoordError::join(JoinStep::StartWatcher, e.to_string()));
        }

        info!(
            "membership: {} joined via {} with {} member(s)",
            self.node_id,
            addr,
            self.members.read().unwrap().len()
        );
        Ok(())
    }

    /// Leave the cluster: destroy session, deregister check, deregister
    /// service, stop listener. Every step is attempted regardless of the
    /// previous step's outcome; failures are logged, not propagated,
    /// because the agent reaps whatever a failed step left behind.
    pub async fn leave(&self) {
        info!("membership: {} leaving", self.node_id);
        self.teardown().await;
    }

    async fn teardown(&self) {
        if let Err(e) = self.session.destroy().await {
            warn!("membership: teardown: session destroy failed: {}", e);
        }
        // Failures are logged by the probe itself.
        let _ = self.probe.deregister_check().await;
        if let Err(e) = self.agent.deregister_service(&self.node_id).await {
            warn!("membership: teardown: service deregister failed: {}", e);
        }
        self.probe.stop_listener();
        self.ha_info.stop();
        // Single waiter (the catalog watcher); the permit survives a
        // teardown that runs before the watcher was ever polled.
        self.shutdown.notify_one();
    }

    /// Start the catalog watcher and the listener-notifier tasks.
    async fn start_watcher(&self) -> CoordResult<()> {
        let mut watch = self.agent.watch_services().await?;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<MemberEvent>();

        // Notifier: the only place user callouts run.
        let listener_cell = self.listener.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let installed = listener_cell.read().unwrap().clone();
                let Some(listener) = installed else {
                    continue;
                };
                match event {
                    MemberEvent::Added(id) => listener.node_added(&id),
                    MemberEvent::Left(id) => listener.node_left(&id),
                }
            }
        });

        let members = self.members.clone();
        let tag = self.config.clustering_tag.clone();
        let self_id = self.node_id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("membership: watcher stopped");
                        break;
                    }
                    event = watch.next() => {
                        match event {
                            Some(event) => {
                                Self::apply_catalog_delta(&members, &event_tx, &tag, &self_id, event);
                            }
                            None => {
                                debug!("membership: watch source closed");
                                break;
                            }
                        }
                    }
                }
            }
            // Dropping event_tx lets the notifier drain and exit.
        });
        Ok(())
    }

    /// Fold one catalog delivery into the member set and queue listener
    /// events: removals first, then additions, never for this node.
    ///
    /// The diff runs against the live set rather than the delivered
    /// previous snapshot: the watcher is the set's only writer after the
    /// join seed, so the two are equivalent in steady state, and the
    /// first delivery must not re-announce peers already seeded at join.
    fn apply_catalog_delta(
        members: &RwLock<HashSet<String>>,
        event_tx: &mpsc::UnboundedSender<MemberEvent>,
        tag: &str,
        self_id: &str,
        event: ServiceWatchEvent,
    ) {
        let next_tagged: HashSet<String> = event
            .next
            .iter()
            .filter(|s| s.has_tag(tag))
            .map(|s| s.id.clone())
            .collect();

        let (removed, added) = {
            let current = members.read().unwrap();
            let removed: Vec<String> = current.difference(&next_tagged).cloned().collect();
            let added: Vec<String> = next_tagged.difference(&current).cloned().collect();
            (removed, added)
        };
        if removed.is_empty() && added.is_empty() {
            return;
        }

        {
            let mut current = members.write().unwrap();
            for id in &removed {
                current.remove(id);
            }
            for id in &added {
                current.insert(id.clone());
            }
        }

        for id in removed {
            info!("membership: node {} left", id);
            if id != self_id {
                let _ = event_tx.send(MemberEvent::Left(id));
            }
        }
        for id in added {
            info!("membership: node {} joined", id);
            if id != self_id {
                let _ = event_tx.send(MemberEvent::Added(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LocalAgent;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingListener {
        added: Mutex<Vec<String>>,
        left: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(Vec::new()),
                left: Mutex::new(Vec::new()),
            })
        }

        fn added(&self) -> Vec<String> {
            self.added.lock().unwrap().clone()
        }

        fn left(&self) -> Vec<String> {
            self.left.lock().unwrap().clone()
        }
    }

    impl MembershipListener for RecordingListener {
        fn node_added(&self, node_id: &str) {
            self.added.lock().unwrap().push(node_id.to_string());
        }

        fn node_left(&self, node_id: &str) {
            self.left.lock().unwrap().push(node_id.to_string());
        }
    }

    fn make_manager(agent: Arc<LocalAgent>, node_id: &str) -> NodeManager {
        let config = CoordConfig {
            probe_port_range: (21000, 21200),
            ..CoordConfig::default()
        };
        let gateway = KvGateway::new(agent.clone(), Duration::from_secs(5));
        NodeManager::new(agent, gateway, config, node_id)
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
    async fn test_solo_join() {
        let agent = Arc::new(LocalAgent::new());
        let manager = make_manager(agent.clone(), "a");
        manager.join().await.unwrap();

        let members = manager.members();
        assert_eq!(members.len(), 1);
        assert!(members.contains("a"));
        assert!(manager.session().session_id().is_some());

        let services = agent.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].has_tag("vertx-clustering"));
    }

    #[tokio::test]
    async fn test_peer_sees_peer_exactly_once() {
        let agent = Arc::new(LocalAgent::new());
        let manager_a = make_manager(agent.clone(), "a");
        let listener_a = RecordingListener::new();
        manager_a.set_listener(listener_a.clone());
        manager_a.join().await.unwrap();

        let manager_b = make_manager(agent.clone(), "b");
        let listener_b = RecordingListener::new();
        manager_b.set_listener(listener_b.clone());
        manager_b.join().await.unwrap();

        wait_until(|| manager_a.members().len() == 2).await;
        assert_eq!(manager_a.members(), manager_b.members());

        wait_until(|| !listener_a.added().is_empty()).await;
        // A saw exactly B arrive; B saw nobody (A was seeded at join).
        assert_eq!(listener_a.added(), vec!["b".to_string()]);
        assert!(listener_b.added().is_empty());
        assert!(listener_a.left().is_empty());
    }

    #[tokio::test]
    async fn test_clean_leave_notifies_peer() {
        let agent = Arc::new(LocalAgent::new());
        let manager_a = make_manager(agent.clone(), "a");
        let listener_a = RecordingListener::new();
        manager_a.set_listener(listener_a.clone());
        manager_a.join().await.unwrap();

        let manager_b = make_manager(agent.clone(), "b");
        manager_b.join().await.unwrap();
        wait_until(|| manager_a.members().len() == 2).await;

        manager_b.leave().await;
        wait_until(|| manager_a.members().len() == 1).await;
        wait_until(|| !listener_a.left().is_empty()).await;
        assert_eq!(listener_a.left(), vec!["b".to_string()]);

        // B's footprint is gone from the agent.
        assert_eq!(agent.list_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dirty_leave_via_critical_check() {
        let agent = Arc::new(LocalAgent::new());
        let manager_a = make_manager(agent.clone(), "a");
        let listener_a = RecordingListener::new();
        manager_a.set_listener(listener_a.clone());
        manager_a.join().await.unwrap();

        let manager_b = make_manager(agent.clone(), "b");
        manager_b.join().await.unwrap();
        wait_until(|| manager_a.members().len() == 2).await;

        // B dies without leaving: its check goes critical.
        agent
            .set_check_status("check:b", corral_proto::catalog::CheckStatus::Critical)
            .await
            .unwrap();

        wait_until(|| manager_a.members().len() == 1).await;
        wait_until(|| !listener_a.left().is_empty()).await;
        assert_eq!(listener_a.left(), vec!["b".to_string()]);
        assert!(manager_a.members().contains("a"));
    }

    #[tokio::test]
    async fn test_no_self_events_on_join_or_leave() {
        let agent = Arc::new(LocalAgent::new());
        let manager = make_manager(agent.clone(), "a");
        let listener = RecordingListener::new();
        manager.set_listener(listener.clone());
        manager.join().await.unwrap();
        manager.leave().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(listener.added().is_empty());
        assert!(listener.left().is_empty());
    }

    #[tokio::test]
    async fn test_join_failure_rolls_back() {
        let agent = Arc::new(LocalAgent::new());
        // Occupy the only port in the range so step 1 cannot bind.
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let config = CoordConfig {
            probe_port_range: (taken, taken),
            ..CoordConfig::default()
        };
        let gateway = KvGateway::new(agent.clone(), Duration::from_secs(5));
        let manager = NodeManager::new(agent.clone(), gateway, config, "a");

        let err = manager.join().await.unwrap_err();
        assert!(matches!(
            err,
            CoordError::Join {
                step: JoinStep::AllocatePort,
                ..
            }
        ));
        // Nothing was left behind.
        assert!(agent.list_services().await.unwrap().is_empty());
        assert!(manager.session().session_id().is_none());
    }

    #[tokio::test]
    async fn test_ha_info_preloaded_before_join_returns() {
        let agent = Arc::new(LocalAgent::new());
        agent
            .kv_put(
                "__vertx.haInfo/group",
                b"payload".to_vec(),
                corral_proto::catalog::PutOptions::default(),
            )
            .await
            .unwrap();

        let manager = make_manager(agent, "a");
        manager.join().await.unwrap();
        // Synchronous read straight after join must already see it.
        assert_eq!(
            manager.ha_info().get("group").as_deref(),
            Some(b"payload".as_slice())
        );
    }
}
