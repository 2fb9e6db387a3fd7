//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the lease and version checks every backend applies.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::{Result, StateError, StrataError};
use crate::template::Value;

use super::lease::LeaseInfo;
use super::types::{HistoryEntry, PhysicalResource, StateSnapshot};

/// Trait for state storage backends.
///
/// Exactly one plan may write to a target at a time. A writer first calls
/// [`begin`](StateStore::begin) with the version it planned against; every
/// later mutation presents the lease and is rejected if the stored version
/// moved underneath it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the current snapshot. Returns an empty snapshot at version 0 if
    /// nothing has been stored yet.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Acquires the write lease.
    ///
    /// Fails with `ConcurrentModification` if the stored version differs from
    /// `expected_version` or another unexpired lease is held.
    async fn begin(&self, holder: &str, expected_version: u64) -> Result<LeaseInfo>;

    /// Records a resource after a successful step. Returns the new version.
    async fn commit(&self, lease: &LeaseInfo, resource: PhysicalResource) -> Result<u64>;

    /// Forgets a resource after a successful delete. Returns the new version.
    async fn remove(&self, lease: &LeaseInfo, logical_name: &str) -> Result<u64>;

    /// Records outputs and a history entry at the end of a run. `outputs`
    /// is `None` when the run failed and the previous outputs stand.
    async fn finalize(
        &self,
        lease: &LeaseInfo,
        outputs: Option<BTreeMap<String, Value>>,
        template_hash: Option<&str>,
        entry: HistoryEntry,
    ) -> Result<u64>;

    /// Releases the lease.
    async fn release(&self, lease: &LeaseInfo) -> Result<()>;

    /// Gets the current lease, if any.
    async fn lease_info(&self) -> Result<Option<LeaseInfo>>;

    /// Drops any lease regardless of holder.
    async fn force_release(&self) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Checks that a new lease may be granted.
pub(super) fn check_begin(
    snapshot: &StateSnapshot,
    current: Option<&LeaseInfo>,
    expected_version: u64,
) -> Result<()> {
    if let Some(existing) = current
        && !existing.is_expired()
    {
        return Err(StrataError::State(StateError::ConcurrentModification {
            expected: expected_version,
            found: snapshot.version,
            holder: Some(existing.holder.clone()),
        }));
    }

    if snapshot.version != expected_version {
        return Err(StrataError::State(StateError::ConcurrentModification {
            expected: expected_version,
            found: snapshot.version,
            holder: None,
        }));
    }

    Ok(())
}

/// Checks that `lease` is the lease currently held and that nobody wrote
/// since its holder last did.
pub(super) fn check_lease(
    snapshot: &StateSnapshot,
    current: Option<&LeaseInfo>,
    lease: &LeaseInfo,
) -> Result<()> {
    let Some(held) = current.filter(|held| held.lease_id == lease.lease_id) else {
        return Err(StrataError::State(StateError::LeaseNotHeld {
            lease_id: lease.lease_id.clone(),
        }));
    };

    if held.version != snapshot.version {
        return Err(StrataError::State(StateError::ConcurrentModification {
            expected: held.version,
            found: snapshot.version,
            holder: None,
        }));
    }

    Ok(())
}

/// Applies a history entry and, on success, the outputs and template hash.
pub(super) fn apply_finalize(
    snapshot: &mut StateSnapshot,
    outputs: Option<BTreeMap<String, Value>>,
    template_hash: Option<&str>,
    entry: HistoryEntry,
) {
    if let Some(outputs) = outputs {
        snapshot.outputs = outputs;
    }
    if let Some(hash) = template_hash {
        snapshot.template_hash = hash.to_string();
    }
    snapshot.add_history(entry);
    snapshot.touch();
}
