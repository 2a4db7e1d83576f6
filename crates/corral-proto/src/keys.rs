//! Key layout of the coordination namespace.
//!
//! The prefixes and `/`-separated sub-paths below are a wire contract:
//! deployments share the KV namespace with existing installations, so the
//! exact strings matter. `/` is the hierarchy separator everywhere.
//!
//! | prefix                            | value                | ephemeral |
//! |-----------------------------------|----------------------|-----------|
//! | `__vertx.haInfo/<key>`            | user bytes           | no        |
//! | `__vertx.subs/<address>/<nodeId>` | encoded subscriber   | yes       |
//! | `__vertx.counters/<name>`         | integer bytes        | no        |
//! | `__vertx.locks/<name>`            | sentinel `"held"`    | yes       |

/// HA-info map prefix. Entries are plain user bytes, not ephemeral.
pub const HA_INFO_MAP: &str = "__vertx.haInfo";

/// Event-bus subscriber multimap prefix. Entries are ephemeral, bound to
/// the subscribing node's session.
pub const SUBS_MAP: &str = "__vertx.subs";

/// Distributed counter prefix.
pub const COUNTERS_MAP: &str = "__vertx.counters";

/// Distributed lock prefix. Entries are ephemeral, one session per lock.
pub const LOCKS_MAP: &str = "__vertx.locks";

/// Sentinel value stored under a held lock key.
pub const LOCK_SENTINEL: &[u8] = b"held";

/// Catalog tag that marks a service record as a cluster member.
pub const CLUSTERING_TAG: &str = "vertx-clustering";

/// Agent-internal gossip health check every session is additionally
/// bound to.
pub const SERF_HEALTH_CHECK: &str = "serfHealth";

/// Id of the liveness check guarding a node.
pub fn check_id(node_id: &str) -> String {
    format!("check:{}", node_id)
}

/// Name of the session owned by a node.
pub fn session_name(node_id: &str) -> String {
    format!("session:{}", node_id)
}

/// Name of the per-lock session held by a node while it owns the lock.
pub fn lock_session_name(lock_name: &str, node_id: &str) -> String {
    format!("session:{}:{}", lock_name, node_id)
}

/// Key of an entry in a flat map (`<map>/<key>`).
pub fn map_key(map: &str, key: &str) -> String {
    format!("{}/{}", map, key)
}

/// Key of a specific node's subscription to an address within a
/// subscriber map.
pub fn sub_key(map: &str, address: &str, node_id: &str) -> String {
    format!("{}/{}/{}", map, address, node_id)
}

/// Prefix covering every subscription to an address within a subscriber
/// map.
pub fn address_prefix(map: &str, address: &str) -> String {
    format!("{}/{}/", map, address)
}

/// Strips `prefix` plus the separator from a key, yielding the trailing
/// segment a cache is keyed on. Returns `None` when the key does not
/// belong to the prefix.
pub fn trailing_segment<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_prefix('/')
}

/// Owner node id of a subscription key (`<map>/<address>/<nodeId>`).
/// Returns `None` for keys that are not three segments deep.
pub fn sub_owner(key: &str) -> Option<&str> {
    let mut segments = key.split('/');
    let owner = segments.nth(2)?;
    if owner.is_empty() || segments.next().is_some() {
        return None;
    }
    Some(owner)
}
