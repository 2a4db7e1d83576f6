//! # corral-proto
//!
//! Shared vocabulary for the corral cluster-coordination core.
//! Provides node and catalog records, the unified error type, the
//! bit-exact key layout of the coordination namespace, tunable
//! defaults, and the opaque value-codec seam.

pub mod catalog;
pub mod codec;
pub mod defaults;
pub mod error;
pub mod keys;
pub mod node;
