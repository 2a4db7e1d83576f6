//! Coordination-core configuration.
//!
//! The facade accepts a plain configuration record; there is no CLI or
//! environment-variable surface in the core. Every field has a default
//! suitable for a local agent.

use std::time::Duration;

use corral_proto::defaults::{
    DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_DEREGISTER_AFTER_SECS, DEFAULT_JOIN_TIMEOUT_SECS,
    DEFAULT_KV_HOST, DEFAULT_KV_PORT, DEFAULT_KV_TIMEOUT_SECS, DEFAULT_LOCK_RETRY_INTERVAL_MS,
    DEFAULT_PROBE_HOST, DEFAULT_PROBE_PORT_HI, DEFAULT_PROBE_PORT_LO,
};
use corral_proto::keys::CLUSTERING_TAG;

#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Location of the coordination agent, for backends that dial out.
    pub kv_endpoint: (String, u16),
    /// Inclusive port range scanned for the health-probe listener.
    pub probe_port_range: (u16, u16),
    /// Host the probe listener binds to, also advertised in the check.
    pub bind_host: String,
    /// How often the agent probes the health listener.
    pub check_interval: Duration,
    /// How long a check may stay critical before the agent deregisters it
    /// and invalidates bound sessions.
    pub deregister_after: Duration,
    /// Overall deadline for the join pipeline.
    pub join_timeout: Duration,
    /// Per-call deadline for KV gateway operations.
    pub kv_timeout: Duration,
    /// Cadence of lock acquire retries within a try-lock budget.
    pub lock_retry_interval: Duration,
    /// Catalog tag marking cluster members.
    pub clustering_tag: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            kv_endpoint: (DEFAULT_KV_HOST.to_string(), DEFAULT_KV_PORT),
            probe_port_range: (DEFAULT_PROBE_PORT_LO, DEFAULT_PROBE_PORT_HI),
            bind_host: DEFAULT_PROBE_HOST.to_string(),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            deregister_after: Duration::from_secs(DEFAULT_DEREGISTER_AFTER_SECS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            kv_timeout: Duration::from_secs(DEFAULT_KV_TIMEOUT_SECS),
            lock_retry_interval: Duration::from_millis(DEFAULT_LOCK_RETRY_INTERVAL_MS),
            clustering_tag: CLUSTERING_TAG.to_string(),
        }
    }
}

impl CoordConfig {
    pub fn with_kv_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.kv_endpoint = (host.into(), port);
        self
    }

    pub fn with_probe_port_range(mut self, lo: u16, hi: u16) -> Self {
        self.probe_port_range = (lo, hi);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = CoordConfig::default();
        assert_eq!(config.kv_endpoint, ("localhost".to_string(), 8500));
        assert_eq!(config.probe_port_range, (2000, 64000));
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.deregister_after, Duration::from_secs(60));
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert_eq!(config.clustering_tag, "vertx-clustering");
    }

    #[test]
    fn test_builders() {
        let config = CoordConfig::default()
            .with_kv_endpoint("agent.internal", 8501)
            .with_probe_port_range(3000, 4000);
        assert_eq!(config.kv_endpoint.0, "agent.internal");
        assert_eq!(config.probe_port_range, (3000, 4000));
    }
}
