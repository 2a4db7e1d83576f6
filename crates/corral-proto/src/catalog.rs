//! Catalog records exchanged with the coordination agent: services,
//! checks, sessions, and KV entries. These mirror what a Consul-style
//! agent stores, reduced to the fields the coordination core uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A service entry in the agent's catalog. A process is a cluster member
/// iff its service record is present and carries the clustering tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Stable service id; equals the node id for cluster members.
    pub id: String,
    /// Service name; equals the node id for cluster members.
    pub name: String,
    /// Catalog tags. Membership is keyed off the clustering tag.
    pub tags: Vec<String>,
}

impl ServiceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Health status of a registered check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Passing,
    Critical,
}

/// A TCP liveness check registered with the agent. The agent probes
/// `host:port` every `interval`; once the check has been critical for
/// `deregister_after`, the agent deregisters it and invalidates every
/// session bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: String,
    /// Service this check guards.
    pub service_id: String,
    pub host: String,
    pub port: u16,
    pub interval: Duration,
    pub deregister_after: Duration,
    pub initial_status: CheckStatus,
}

/// What the agent does to keys acquired under a session when the session
/// is invalidated. The coordination core always uses `Delete`: keys are
/// removed outright, never left behind with a stale lock index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionBehavior {
    Delete,
    Release,
}

/// A session to create in the agent. Invalidated when any bound check
/// fails; on invalidation every key acquired under it is handled per
/// `behavior`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: String,
    /// Check ids whose failure invalidates this session.
    pub checks: Vec<String>,
    pub behavior: SessionBehavior,
}

/// A KV entry together with the store's version index, needed to
/// compare-and-set against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Store-assigned version; bumped on every write to the key.
    pub modify_index: u64,
}

/// Options for a KV put.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Bind the key's lifetime to this session. The put is denied
    /// (returns false) if another live session already holds the key.
    pub acquire_session: Option<String>,
    /// Compare-and-set: apply only if the key's current modify index
    /// equals this value. Zero means "only if the key does not exist".
    pub cas: Option<u64>,
}

impl PutOptions {
    pub fn acquire(session_id: impl Into<String>) -> Self {
        Self {
            acquire_session: Some(session_id.into()),
            cas: None,
        }
    }

    pub fn cas(index: u64) -> Self {
        Self {
            acquire_session: None,
            cas: Some(index),
        }
    }
}
