//! # corral
//!
//! Cluster-coordination core over a Consul-style agent: node membership
//! with join/leave notifications, an ephemeral event-bus subscriber
//! multimap, distributed locks and counters, and the session/health
//! fabric that ties a node's cluster footprint to its liveness.
//!
//! The agent is reached through the [`agent::CoordAgent`] seam; the
//! in-process [`agent::LocalAgent`] backend serves development and
//! testing. Application code talks to [`cluster::Coordinator`]:
//!
//! ```ignore
//! let agent = Arc::new(LocalAgent::new());
//! let node = Coordinator::new(agent, CoordConfig::default(), "node-1");
//! node.join().await?;
//! let subs = node.subs_map(SUBS_MAP);
//! subs.add("orders", &SubscriberInfo::new("node-1", "10.0.0.5", 5501)).await?;
//! ```

pub mod agent;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod counter;
pub mod gateway;
pub mod health;
pub mod lock;
pub mod membership;
pub mod session;
pub mod state;
pub mod submap;

pub use cluster::Coordinator;
pub use config::CoordConfig;
pub use membership::MembershipListener;
pub use state::NodeState;

// Shared vocabulary re-exported for convenience.
pub use corral_proto::codec::{BincodeCodec, BytesCodec, Codec};
pub use corral_proto::error::{CoordError, CoordResult, JoinStep};
pub use corral_proto::keys;
pub use corral_proto::node::SubscriberInfo;
