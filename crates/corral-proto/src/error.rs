/// Corral error types.
///
/// Every fallible operation across the coordination core returns the same
/// unified enum so that callers can match on stable kinds instead of
/// unwinding backend-specific exception chains.
use thiserror::Error;

/// Step of the join pipeline, carried by [`CoordError::Join`] for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    /// Allocating a free TCP port for the health probe.
    AllocatePort,
    /// Binding the probe listener.
    StartListener,
    /// Registering the tagged service record.
    RegisterService,
    /// Registering the TCP liveness check.
    RegisterCheck,
    /// Creating the node session.
    RegisterSession,
    /// Listing tagged peers to seed the membership set.
    DiscoverPeers,
    /// Preloading the HA-info snapshot.
    PreloadHaInfo,
    /// Starting the membership watcher.
    StartWatcher,
    /// The overall join deadline expired.
    Deadline,
}

impl std::fmt::Display for JoinStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AllocatePort => "allocate-port",
            Self::StartListener => "start-listener",
            Self::RegisterService => "register-service",
            Self::RegisterCheck => "register-check",
            Self::RegisterSession => "register-session",
            Self::DiscoverPeers => "discover-peers",
            Self::PreloadHaInfo => "preload-ha-info",
            Self::StartWatcher => "start-watcher",
            Self::Deadline => "deadline",
        };
        write!(f, "{}", name)
    }
}

/// Unified error type for all corral operations.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The coordination agent could not be reached or the call timed out.
    #[error("agent transport failure: {0}")]
    Transport(String),

    /// A compare-and-set or session-acquire race was lost.
    #[error("kv write lost a contention race")]
    Contention,

    /// An individual entry failed to decode. Never fails a list call;
    /// the affected entry is treated as absent.
    #[error("value decode failed: {detail}")]
    Decode { detail: String },

    /// Join aborted. Teardown of prior steps has already run.
    #[error("join failed at step {step}: {reason}")]
    Join { step: JoinStep, reason: String },

    /// A write carrying the current session id was rejected because the
    /// session is no longer valid. The node must re-join.
    #[error("node session has been invalidated")]
    SessionInvalidated,

    /// No session is registered for this node yet.
    #[error("no active session for this node")]
    NoSession,

    /// The component has been shut down.
    #[error("component is shut down")]
    ShutDown,

    /// The agent rejected the request (unknown id, bad arguments).
    #[error("agent rejected request: {0}")]
    Agent(String),
}

impl CoordError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport(detail.into())
    }

    pub fn decode(detail: impl Into<String>) -> Self {
        Self::Decode {
            detail: detail.into(),
        }
    }

    pub fn join(step: JoinStep, reason: impl Into<String>) -> Self {
        Self::Join {
            step,
            reason: reason.into(),
        }
    }

    /// Whether this error means the node session died underneath us and
    /// the owning facade must transition to a failed state.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::SessionInvalidated)
    }
}

/// Result type alias for corral operations.
pub type CoordResult<T> = Result<T, CoordError>;

impl From<std::io::Error> for CoordError {
    fn from(e: std::io::Error) -> Self {
        CoordError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_error_names_step() {
        let err = CoordError::join(JoinStep::RegisterCheck, "agent refused");
        assert_eq!(
            err.to_string(),
            "join failed at step register-check: agent refused"
        );
    }

    #[test]
    fn test_session_loss_detection() {
        assert!(CoordError::SessionInvalidated.is_session_loss());
        assert!(!CoordError::Contention.is_session_loss());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: CoordError = io.into();
        assert!(matches!(err, CoordError::Transport(_)));
    }
}
