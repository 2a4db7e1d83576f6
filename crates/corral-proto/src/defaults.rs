//! Tunable operational defaults for the coordination core.
//!
//! Namespace-level constants (key prefixes, tags, check names) live in
//! [`crate::keys`]; they are part of the wire contract and must not be
//! tuned. This module centralizes the defaults a deployment may override
//! through the configuration record.

// ─── Agent Endpoint ─────────────────────────────────────────────────────────

/// Default host of the coordination agent.
pub const DEFAULT_KV_HOST: &str = "localhost";

/// Default port of the coordination agent.
pub const DEFAULT_KV_PORT: u16 = 8500;

// ─── Health Probe ───────────────────────────────────────────────────────────

/// Lower bound (inclusive) of the probe port scan range.
pub const DEFAULT_PROBE_PORT_LO: u16 = 2000;

/// Upper bound (inclusive) of the probe port scan range.
pub const DEFAULT_PROBE_PORT_HI: u16 = 64000;

/// Host the probe listener binds to.
pub const DEFAULT_PROBE_HOST: &str = "127.0.0.1";

/// Interval at which the agent probes the health listener (seconds).
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

/// How long a check may stay critical before the agent deregisters it and
/// invalidates bound sessions (seconds).
pub const DEFAULT_DEREGISTER_AFTER_SECS: u64 = 60;

// ─── Timeouts ───────────────────────────────────────────────────────────────

/// Overall deadline for the join pipeline (seconds).
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 30;

/// Per-call timeout for KV gateway operations (seconds).
pub const DEFAULT_KV_TIMEOUT_SECS: u64 = 10;

/// Interval between lock acquire retries (milliseconds).
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_range_is_sane() {
        assert!(DEFAULT_PROBE_PORT_LO < DEFAULT_PROBE_PORT_HI);
    }
}
