//! Distributed counters.
//!
//! One store key per counter, updated through a compare-and-swap loop on
//! the key's modify index. Counters are plain cluster state: they are not
//! ephemeral and survive the nodes that touched them.

use tracing::trace;

use corral_proto::catalog::PutOptions;
use corral_proto::error::{CoordError, CoordResult};
use corral_proto::keys::{map_key, COUNTERS_MAP};

use crate::gateway::KvGateway;

/// A named cluster-wide counter.
pub struct DistributedCounter {
    name: String,
    key: String,
    gateway: KvGateway,
}

impl DistributedCounter {
    pub fn new(name: impl Into<String>, gateway: KvGateway) -> Self {
        let name = name.into();
        let key = map_key(COUNTERS_MAP, &name);
        Self { name, key, gateway }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, bytes: &[u8]) -> CoordResult<i64> {
        bincode::deserialize(bytes).map_err(|e| CoordError::decode(e.to_string()))
    }

    fn encode(&self, value: i64) -> CoordResult<Vec<u8>> {
        bincode::serialize(&value).map_err(|e| CoordError::decode(e.to_string()))
    }

    /// Current value and the modify index to CAS against. An absent key
    /// reads as zero at index zero, which makes the first write a
    /// create-only put.
    async fn read(&self) -> CoordResult<(i64, u64)> {
        match self.gateway.entry(&self.key).await? {
            Some(pair) => Ok((self.decode(&pair.value)?, pair.modify_index)),
            None => Ok((0, 0)),
        }
    }

    /// Current value.
    pub async fn get(&self) -> CoordResult<i64> {
        Ok(self.read().await?.0)
    }

    /// Add `delta` and return the new value.
    pub async fn add_and_get(&self, delta: i64) -> CoordResult<i64> {
        loop {
            let (current, index) = self.read().await?;
            let next = current + delta;
            if self
                .gateway
                .put(&self.key, self.encode(next)?, PutOptions::cas(index))
                .await?
            {
                return Ok(next);
            }
            trace!("counter {}: cas race lost, retrying", self.name);
        }
    }

    /// Add `delta` and return the previous value.
    pub async fn get_and_add(&self, delta: i64) -> CoordResult<i64> {
        Ok(self.add_and_get(delta).await? - delta)
    }

    pub async fn increment_and_get(&self) -> CoordResult<i64> {
        self.add_and_get(1).await
    }

    pub async fn get_and_increment(&self) -> CoordResult<i64> {
        self.get_and_add(1).await
    }

    /// Set the counter to `value` only if it currently reads `expected`.
    /// A concurrent writer makes this return `false`; the caller decides
    /// whether to retry.
    pub async fn compare_and_set(&self, expected: i64, value: i64) -> CoordResult<bool> {
        let (current, index) = self.read().await?;
        if current != expected {
            return Ok(false);
        }
        self.gateway
            .put(&self.key, self.encode(value)?, PutOptions::cas(index))
            .await
    }
}
