/// Node identity and subscriber types.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies where a message for an event-bus address should be delivered:
/// the subscriber's endpoint plus the id of the node that owns the
/// subscription. The owner id is what ties the entry's lifetime to that
/// node's session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberInfo {
    /// Id of the node that registered the subscription.
    pub node_id: String,
    /// Host the subscriber listens on.
    pub host: String,
    /// Port the subscriber listens on.
    pub port: u16,
}

impl SubscriberInfo {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
        }
    }

    /// The `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SubscriberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.host, self.port, self.node_id)
    }
}
