//! State management module for the Strata engine.
//!
//! This module provides persistent state storage for tracking applied
//! resources: physical ids, last-applied properties, attributes, outputs and
//! apply history, guarded by a single-writer lease and a version token.

mod lease;
mod local;
mod memory;
mod store;
mod types;

pub use lease::{LEASE_TTL_SECS, LeaseInfo, generate_holder_id};
pub use local::LocalStateStore;
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, MAX_HISTORY, PhysicalResource, STATE_FORMAT, StateSnapshot,
};
