//! Watch-driven local cache.
//!
//! Generic read-through cache over one KV prefix. Reads are synchronous
//! against a concurrent map; the map is kept current by two write paths:
//!
//! 1. the prefix watch: each delivered snapshot is diffed against the
//!    map — keys present are inserted or updated, keys absent are
//!    removed, last write wins;
//! 2. acknowledged local writes: after the gateway confirms a put or
//!    delete, the map is updated synchronously before the result reaches
//!    the caller, so the writing node always reads its own writes. The
//!    later watch delivery for the same key is idempotent.
//!
//! A value that fails to decode is logged and skipped; it neither fails
//! the watch nor touches unrelated entries. The cache is authoritative
//! only for read-side decisions that tolerate eventual consistency.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use corral_proto::catalog::PutOptions;
use corral_proto::codec::Codec;
use corral_proto::error::CoordResult;
use corral_proto::keys::{map_key, trailing_segment};

use crate::agent::KvSnapshot;
use crate::gateway::KvGateway;

/// Prefix-scoped cache kept current by a KV watch and by acknowledged
/// local writes. Keyed by the trailing key segment under the prefix.
pub struct WatchCache<V> {
    prefix: String,
    gateway: KvGateway,
    codec: Arc<dyn Codec<V>>,
    map: Arc<DashMap<String, V>>,
    shutdown: Arc<Notify>,
}

impl<V> WatchCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(gateway: KvGateway, prefix: impl Into<String>, codec: Arc<dyn Codec<V>>) -> Self {
        Self {
            prefix: prefix.into(),
            gateway,
            codec,
            map: Arc::new(DashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Fill the map from a full listing of the prefix. Used at join time
    /// so the first synchronous read already sees the cluster state.
    pub async fn preload(&self) -> CoordResult<()> {
        let entries = self.gateway.list(&self.prefix).await?;
        for pair in entries {
            let Some(segment) = trailing_segment(&self.prefix, &pair.key) else {
                continue;
            };
            match self.codec.decode(&pair.value) {
                Ok(value) => {
                    self.map.insert(segment.to_string(), value);
                }
                Err(e) => {
                    warn!("cache {}: skipping undecodable {}: {}", self.prefix, pair.key, e);
                }
            }
        }
        info!(
            "cache {}: preloaded {} entr(ies)",
            self.prefix,
            self.map.len()
        );
        Ok(())
    }

    /// Subscribe to the prefix and keep the map current until `stop`.
    pub async fn start_watch(&self) -> CoordResult<()> {
        let mut watch = self.gateway.watch_prefix(&self.prefix).await?;
        let map = self.map.clone();
        let codec = self.codec.clone();
        let prefix = self.prefix.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("cache {}: watch stopped", prefix);
                        break;
                    }
                    event = watch.next() => {
                        match event {
                            Some(event) => {
                                Self::apply_snapshot(&map, &codec, &prefix, &event.next);
                            }
                            None => {
                                debug!("cache {}: watch source closed", prefix);
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Apply one watched snapshot: upsert decodable entries, drop keys no
    /// longer present.
    fn apply_snapshot(
        map: &DashMap<String, V>,
        codec: &Arc<dyn Codec<V>>,
        prefix: &str,
        next: &KvSnapshot,
    ) {
        let mut seen = std::collections::HashSet::with_capacity(next.len());
        for (key, bytes) in next {
            let Some(segment) = trailing_segment(prefix, key) else {
                continue;
            };
            seen.insert(segment.to_string());
            match codec.decode(bytes) {
                Ok(value) => {
                    map.insert(segment.to_string(), value);
                }
                Err(e) => {
                    warn!("cache {}: skipping undecodable {}: {}", prefix, key, e);
                }
            }
        }
        map.retain(|k, _| seen.contains(k));
    }

    /// Synchronous cached read.
    pub fn get(&self, key: &str) -> Option<V> {
        self.map.get(key).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Keys currently cached.
    pub fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    /// Write through the gateway, then update the map synchronously so
    /// this node reads its own write.
    pub async fn put(&self, key: &str, value: V) -> CoordResult<()> {
        let bytes = self.codec.encode(&value)?;
        self.gateway
            .put(&map_key(&self.prefix, key), bytes, PutOptions::default())
            .await?;
        self.map.insert(key.to_string(), value);
        Ok(())
    }

    /// Delete through the gateway, then update the map synchronously.
    pub async fn remove(&self, key: &str) -> CoordResult<()> {
        self.gateway.delete(&map_key(&self.prefix, key)).await?;
        self.map.remove(key);
        Ok(())
    }

    /// Stop the watch task. The notify permit is stored, so stopping
    /// before the task was first polled still takes effect.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CoordAgent, LocalAgent};
    use corral_proto::codec::BincodeCodec;
    use std::time::Duration;

    fn make_cache(agent: Arc<LocalAgent>) -> WatchCache<String> {
        let gateway = KvGateway::new(agent, Duration::from_secs(5));
        WatchCache::new(gateway, "app.cfg", Arc::new(BincodeCodec::new()))
    }

    fn encoded(value: &str) -> Vec<u8> {
        bincode::serialize(&value.to_string()).unwrap()
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
    async fn test_read_your_writes_is_synchronous() {
        let agent = Arc::new(LocalAgent::new());
        let cache = make_cache(agent);
        // No watch running at all: the ack path alone must make the
        // write visible.
        cache.put("mode", "ha".to_string()).await.unwrap();
        assert_eq!(cache.get("mode").as_deref(), Some("ha"));

        cache.remove("mode").await.unwrap();
        assert!(cache.get("mode").is_none());
    }

    #[tokio::test]
    async fn test_watch_feeds_remote_writes() {
        let agent = Arc::new(LocalAgent::new());
        let cache = make_cache(agent.clone());
        cache.start_watch().await.unwrap();

        agent
            .kv_put("app.cfg/peer", encoded("remote"), PutOptions::default())
            .await
            .unwrap();
        wait_until(|| cache.get("peer").is_some()).await;
        assert_eq!(cache.get("peer").as_deref(), Some("remote"));

        agent.kv_delete("app.cfg/peer").await.unwrap();
        wait_until(|| cache.get("peer").is_none()).await;
    }

    #[tokio::test]
    async fn test_preload_fills_snapshot() {
        let agent = Arc::new(LocalAgent::new());
        agent
            .kv_put("app.cfg/a", encoded("1"), PutOptions::default())
            .await
            .unwrap();
        agent
            .kv_put("app.cfg/b", encoded("2"), PutOptions::default())
            .await
            .unwrap();

        let cache = make_cache(agent);
        cache.preload().await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_corrupt_entry_does_not_poison_cache() {
        let agent = Arc::new(LocalAgent::new());
        let cache = make_cache(agent.clone());
        cache.start_watch().await.unwrap();

        agent
            .kv_put("app.cfg/good", encoded("ok"), PutOptions::default())
            .await
            .unwrap();
        wait_until(|| cache.get("good").is_some()).await;

        // Corrupt bytes under the same prefix: skipped, nothing else
        // removed, and the watch keeps working afterwards.
        agent
            .kv_put("app.cfg/bad", vec![0xFF, 0xFE], PutOptions::default())
            .await
            .unwrap();
        agent
            .kv_put("app.cfg/later", encoded("fine"), PutOptions::default())
            .await
            .unwrap();
        wait_until(|| cache.get("later").is_some()).await;

        assert_eq!(cache.get("good").as_deref(), Some("ok"));
        assert!(cache.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_stop_halts_updates() {
        let agent = Arc::new(LocalAgent::new());
        let cache = make_cache(agent.clone());
        cache.start_watch().await.unwrap();
        cache.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        agent
            .kv_put("app.cfg/x", encoded("v"), PutOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("x").is_none());
    }
}
