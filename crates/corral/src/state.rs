//! Node lifetime state machine.
//!
//! ```text
//! NEW ──join──► JOINING ──ok──► ACTIVE ──leave──► LEAVING ──► STOPPED
//!                  │                      │
//!                  └── failure ──► FAILED ◄┘ (session invalidated)
//! ```
//!
//! STOPPED and FAILED are terminal; a facade in FAILED must be discarded
//! and a fresh one joined in its place.

use std::sync::{Arc, RwLock};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    New,
    Joining,
    Active,
    Leaving,
    Stopped,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Shared, synchronously readable state cell. Components that detect a
/// session loss mark the cell failed; the facade refuses further
/// lifecycle operations from a terminal state.
pub struct StateCell {
    state: RwLock<NodeState>,
}

impl StateCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(NodeState::New),
        })
    }

    pub fn get(&self) -> NodeState {
        *self.state.read().unwrap()
    }

    /// Move to `next` only when currently in `expected`. Returns whether
    /// the transition happened.
    pub fn transition(&self, expected: NodeState, next: NodeState) -> bool {
        let mut state = self.state.write().unwrap();
        if *state != expected {
            return false;
        }
        *state = next;
        true
    }

    /// Force the terminal FAILED state, from anywhere but STOPPED.
    pub fn mark_failed(&self) {
        let mut state = self.state.write().unwrap();
        if *state == NodeState::Stopped {
            return;
        }
        if *state != NodeState::Failed {
            warn!("node state: {:?} -> Failed", *state);
            *state = NodeState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), NodeState::New);
        assert!(cell.transition(NodeState::New, NodeState::Joining));
        assert!(cell.transition(NodeState::Joining, NodeState::Active));
        assert!(cell.transition(NodeState::Active, NodeState::Leaving));
        assert!(cell.transition(NodeState::Leaving, NodeState::Stopped));
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn test_transition_refuses_wrong_source() {
        let cell = StateCell::new();
        assert!(!cell.transition(NodeState::Active, NodeState::Leaving));
        assert_eq!(cell.get(), NodeState::New);
    }

    #[test]
    fn test_mark_failed_is_sticky_but_not_after_stop() {
        let cell = StateCell::new();
        cell.mark_failed();
        assert_eq!(cell.get(), NodeState::Failed);

        let cell = StateCell::new();
        assert!(cell.transition(NodeState::New, NodeState::Joining));
        assert!(cell.transition(NodeState::Joining, NodeState::Active));
        assert!(cell.transition(NodeState::Active, NodeState::Leaving));
        assert!(cell.transition(NodeState::Leaving, NodeState::Stopped));
        cell.mark_failed();
        assert_eq!(cell.get(), NodeState::Stopped);
    }
}
