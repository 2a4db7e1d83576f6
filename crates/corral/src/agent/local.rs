//! Local (single-process) coordination agent.
//!
//! This backend is designed for development and testing. It does not
//! perform any networking: the KV store, service catalog, checks and
//! sessions all live in process memory, and watch deliveries are pushed
//! through in-process channels in mutation order.
//!
//! The session/check semantics the core depends on are implemented
//! faithfully:
//! - every KV entry carries a modify index and an optional owning session;
//! - an acquire on a key held by a different live session is denied;
//! - destroying a session applies its behavior to every key it holds
//!   (DELETE removes them outright);
//! - a check transitioning to critical deregisters the guarded service
//!   and invalidates every session bound to the check. The production
//!   agent does this only after its deregister-after window; the local
//!   backend collapses that window to zero so tests observe the end state
//!   immediately.
//!
//! Several facades sharing one `LocalAgent` emulate a multi-node cluster
//! in a single process.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use corral_proto::catalog::{
    CheckRecord, CheckStatus, KvPair, PutOptions, ServiceRecord, SessionBehavior, SessionRecord,
};
use corral_proto::error::{CoordError, CoordResult};
use corral_proto::keys::SERF_HEALTH_CHECK;

use super::{CoordAgent, KvSnapshot, KvWatchEvent, ServiceWatchEvent, WatchHandle};

/// A stored KV entry.
#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    modify_index: u64,
    /// Session the key is acquired under, if any.
    session: Option<String>,
}

/// A registered check and its current status.
#[derive(Debug, Clone)]
struct CheckState {
    record: CheckRecord,
    status: CheckStatus,
}

/// A registered KV prefix watcher. `prev` is the snapshot delivered last,
/// kept here so each event carries the correct (prev, next) pair.
struct KvWatcherReg {
    prefix: String,
    prev: KvSnapshot,
    tx: mpsc::UnboundedSender<KvWatchEvent>,
}

/// A registered service-catalog watcher.
struct SvcWatcherReg {
    prev: Vec<ServiceRecord>,
    tx: mpsc::UnboundedSender<ServiceWatchEvent>,
}

struct LocalState {
    kv: BTreeMap<String, KvEntry>,
    /// Monotonic version source for modify indices.
    modify_counter: u64,
    services: BTreeMap<String, ServiceRecord>,
    checks: HashMap<String, CheckState>,
    sessions: HashMap<String, SessionRecord>,
    session_counter: u64,
    kv_watchers: Vec<KvWatcherReg>,
    svc_watchers: Vec<SvcWatcherReg>,
}

impl LocalState {
    fn new() -> Self {
        Self {
            kv: BTreeMap::new(),
            modify_counter: 0,
            services: BTreeMap::new(),
            checks: HashMap::new(),
            sessions: HashMap::new(),
            session_counter: 0,
            kv_watchers: Vec::new(),
            svc_watchers: Vec::new(),
        }
    }

    fn snapshot(&self, prefix: &str) -> KvSnapshot {
        self.kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    fn service_list(&self) -> Vec<ServiceRecord> {
        self.services.values().cloned().collect()
    }

    /// Push a (prev, next) event to every KV watcher whose prefix content
    /// changed. Senders are unbounded so emission under the state lock is
    /// non-blocking and stays in mutation order; watchers whose receiver
    /// is gone are pruned.
    fn publish_kv(&mut self) {
        let snapshots: Vec<KvSnapshot> = self
            .kv_watchers
            .iter()
            .map(|w| self.snapshot(&w.prefix))
            .collect();
        let mut dead = Vec::new();
        for (i, (watcher, next)) in self.kv_watchers.iter_mut().zip(snapshots).enumerate() {
            if watcher.prev == next {
                continue;
            }
            let event = KvWatchEvent {
                prev: std::mem::replace(&mut watcher.prev, next.clone()),
                next,
            };
            if watcher.tx.send(event).is_err() {
                dead.push(i);
            }
        }
        for i in dead.into_iter().rev() {
            self.kv_watchers.swap_remove(i);
        }
    }

    /// Push a (prev, next) event to every catalog watcher after a service
    /// change.
    fn publish_services(&mut self) {
        let next = self.service_list();
        let mut dead = Vec::new();
        for (i, watcher) in self.svc_watchers.iter_mut().enumerate() {
            if watcher.prev == next {
                continue;
            }
            let event = ServiceWatchEvent {
                prev: std::mem::replace(&mut watcher.prev, next.clone()),
                next: next.clone(),
            };
            if watcher.tx.send(event).is_err() {
                dead.push(i);
            }
        }
        for i in dead.into_iter().rev() {
            self.svc_watchers.swap_remove(i);
        }
    }

    /// Apply a session's invalidation behavior to the keys it holds and
    /// forget the session.
    fn invalidate_session(&mut self, session_id: &str) {
        let Some(record) = self.sessions.remove(session_id) else {
            return;
        };
        match record.behavior {
            SessionBehavior::Delete => {
                let before = self.kv.len();
                self.kv
                    .retain(|_, e| e.session.as_deref() != Some(session_id));
                let dropped = before - self.kv.len();
                if dropped > 0 {
                    debug!(
                        "local agent: session {} invalidated, {} key(s) deleted",
                        session_id, dropped
                    );
                }
            }
            SessionBehavior::Release => {
                for entry in self.kv.values_mut() {
                    if entry.session.as_deref() == Some(session_id) {
                        entry.session = None;
                    }
                }
            }
        }
    }

    /// Invalidate every session bound to `check_id`.
    fn invalidate_sessions_bound_to(&mut self, check_id: &str) {
        let bound: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.checks.iter().any(|c| c == check_id))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in bound {
            info!(
                "local agent: check {} failure invalidates session {}",
                check_id, session_id
            );
            self.invalidate_session(&session_id);
        }
    }
}

/// In-process coordination agent. All operations complete immediately;
/// there is no network I/O.
pub struct LocalAgent {
    state: RwLock<LocalState>,
}

impl LocalAgent {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LocalState::new()),
        }
    }
}

impl Default for LocalAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordAgent for LocalAgent {
    fn name(&self) -> &str {
        "local"
    }

    async fn kv_get(&self, key: &str) -> CoordResult<Option<Vec<u8>>> {
        let state = self.state.read().await;
        Ok(state.kv.get(key).map(|e| e.value.clone()))
    }

    async fn kv_entry(&self, key: &str) -> CoordResult<Option<KvPair>> {
        let state = self.state.read().await;
        Ok(state.kv.get(key).map(|e| KvPair {
            key: key.to_string(),
            value: e.value.clone(),
            modify_index: e.modify_index,
        }))
    }

    async fn kv_list(&self, prefix: &str) -> CoordResult<Vec<KvPair>> {
        let state = self.state.read().await;
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KvPair {
                key: k.clone(),
                value: e.value.clone(),
                modify_index: e.modify_index,
            })
            .collect())
    }

    async fn kv_put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> CoordResult<bool> {
        let mut state = self.state.write().await;

        if let Some(cas) = opts.cas {
            let current = state.kv.get(key).map(|e| e.modify_index).unwrap_or(0);
            if current != cas {
                trace!("local agent: cas miss on {} ({} != {})", key, current, cas);
                return Ok(false);
            }
        }

        if let Some(session_id) = &opts.acquire_session {
            if !state.sessions.contains_key(session_id) {
                return Err(CoordError::SessionInvalidated);
            }
            if let Some(holder) = state.kv.get(key).and_then(|e| e.session.as_deref()) {
                if holder != session_id.as_str() {
                    trace!("local agent: acquire denied on {} (held by {})", key, holder);
                    return Ok(false);
                }
            }
        }

        state.modify_counter += 1;
        let modify_index = state.modify_counter;
        // A plain put on an acquired key updates the value but leaves the
        // holding session in place.
        let session = opts
            .acquire_session
            .or_else(|| state.kv.get(key).and_then(|e| e.session.clone()));
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                modify_index,
                session,
            },
        );
        state.publish_kv();
        Ok(true)
    }

    async fn kv_delete(&self, key: &str) -> CoordResult<()> {
        let mut state = self.state.write().await;
        if state.kv.remove(key).is_some() {
            state.publish_kv();
        }
        Ok(())
    }

    async fn kv_delete_prefix(&self, prefix: &str) -> CoordResult<()> {
        let mut state = self.state.write().await;
        let before = state.kv.len();
        state.kv.retain(|k, _| !k.starts_with(prefix));
        if state.kv.len() != before {
            state.publish_kv();
        }
        Ok(())
    }

    async fn watch_kv_prefix(&self, prefix: &str) -> CoordResult<WatchHandle<KvWatchEvent>> {
        let mut state = self.state.write().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let prev = state.snapshot(prefix);
        state.kv_watchers.push(KvWatcherReg {
            prefix: prefix.to_string(),
            prev,
            tx,
        });
        Ok(WatchHandle::new(rx))
    }

    async fn register_service(&self, record: ServiceRecord) -> CoordResult<()> {
        let mut state = self.state.write().await;
        info!("local agent: register service {}", record.id);
        state.services.insert(record.id.clone(), record);
        state.publish_services();
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> CoordResult<()> {
        let mut state = self.state.write().await;
        if state.services.remove(service_id).is_none() {
            debug!("local agent: deregister of unknown service {}", service_id);
            return Ok(());
        }
        info!("local agent: deregister service {}", service_id);
        // Removing a service takes its checks with it, which in turn
        // invalidates sessions bound to those checks.
        let orphaned: Vec<String> = state
            .checks
            .iter()
            .filter(|(_, c)| c.record.service_id == service_id)
            .map(|(id, _)| id.clone())
            .collect();
        for check_id in orphaned {
            state.checks.remove(&check_id);
            state.invalidate_sessions_bound_to(&check_id);
        }
        state.publish_kv();
        state.publish_services();
        Ok(())
    }

    async fn list_services(&self) -> CoordResult<Vec<ServiceRecord>> {
        let state = self.state.read().await;
        Ok(state.service_list())
    }

    async fn watch_services(&self) -> CoordResult<WatchHandle<ServiceWatchEvent>> {
        let mut state = self.state.write().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let prev = state.service_list();
        state.svc_watchers.push(SvcWatcherReg {
            prev,
            tx,
        });
        Ok(WatchHandle::new(rx))
    }

    async fn register_check(&self, record: CheckRecord) -> CoordResult<()> {
        let mut state = self.state.write().await;
        if !state.services.contains_key(&record.service_id) {
            return Err(CoordError::Agent(format!(
                "check {} references unknown service {}",
                record.id, record.service_id
            )));
        }
        debug!(
            "local agent: register check {} on {}:{}",
            record.id, record.host, record.port
        );
        let status = record.initial_status;
        state
            .checks
            .insert(record.id.clone(), CheckState { record, status });
        Ok(())
    }

    async fn deregister_check(&self, check_id: &str) -> CoordResult<()> {
        let mut state = self.state.write().await;
        if state.checks.remove(check_id).is_none() {
            debug!("local agent: deregister of unknown check {}", check_id);
            return Ok(());
        }
        state.invalidate_sessions_bound_to(check_id);
        state.publish_kv();
        Ok(())
    }

    async fn set_check_status(&self, check_id: &str, status: CheckStatus) -> CoordResult<()> {
        let mut state = self.state.write().await;
        let Some(check) = state.checks.get_mut(check_id) else {
            return Err(CoordError::Agent(format!("unknown check {}", check_id)));
        };
        let was = check.status;
        check.status = status;
        if was == CheckStatus::Critical || status != CheckStatus::Critical {
            return Ok(());
        }
        // Critical transition: the production agent waits out its
        // deregister-after window, then drops the guarded service and
        // invalidates bound sessions. Here that happens immediately.
        warn!("local agent: check {} went critical", check_id);
        let service_id = check.record.service_id.clone();
        state.checks.remove(check_id);
        state.invalidate_sessions_bound_to(check_id);
        state.services.remove(&service_id);
        state.publish_kv();
        state.publish_services();
        Ok(())
    }

    async fn create_session(&self, record: SessionRecord) -> CoordResult<String> {
        let mut state = self.state.write().await;
        for check_id in &record.checks {
            if check_id != SERF_HEALTH_CHECK && !state.checks.contains_key(check_id) {
                return Err(CoordError::Agent(format!(
                    "session {} binds unknown check {}",
                    record.name, check_id
                )));
            }
        }
        state.session_counter += 1;
        let session_id = format!("session-{:04}", state.session_counter);
        debug!("local agent: created {} for {}", session_id, record.name);
        state.sessions.insert(session_id.clone(), record);
        Ok(session_id)
    }

    async fn destroy_session(&self, session_id: &str) -> CoordResult<()> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(session_id) {
            info!("local agent: destroying session {}", session_id);
            state.invalidate_session(session_id);
            state.publish_kv();
        }
        Ok(())
    }
}
