//! In-memory state storage backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::template::Value;

use super::lease::{LEASE_TTL_SECS, LeaseInfo, generate_holder_id};
use super::store::{StateStore, apply_finalize, check_begin, check_lease};
use super::types::{HistoryEntry, PhysicalResource, StateSnapshot};

#[derive(Debug, Default)]
struct Inner {
    snapshot: StateSnapshot,
    lease: Option<LeaseInfo>,
}

/// State store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with a snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: Mutex::new(Inner { snapshot, lease: None }),
        }
    }

    async fn mutate(&self, lease: &LeaseInfo, apply: impl FnOnce(&mut StateSnapshot) + Send) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Inner { snapshot, lease: held } = &mut *inner;
        check_lease(snapshot, held.as_ref(), lease)?;

        apply(&mut *snapshot);
        if let Some(held) = held.as_mut() {
            held.version = snapshot.version;
        }
        debug!("State committed at version {}", snapshot.version);
        Ok(snapshot.version)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self.inner.lock().await.snapshot.clone())
    }

    async fn begin(&self, holder: &str, expected_version: u64) -> Result<LeaseInfo> {
        let mut inner = self.inner.lock().await;
        check_begin(&inner.snapshot, inner.lease.as_ref(), expected_version)?;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lease = LeaseInfo::new(&holder_id, inner.snapshot.version, LEASE_TTL_SECS);
        inner.lease = Some(lease.clone());
        Ok(lease)
    }

    async fn commit(&self, lease: &LeaseInfo, resource: PhysicalResource) -> Result<u64> {
        self.mutate(lease, move |snapshot| snapshot.set(resource)).await
    }

    async fn remove(&self, lease: &LeaseInfo, logical_name: &str) -> Result<u64> {
        self.mutate(lease, |snapshot| {
            snapshot.remove(logical_name);
        })
        .await
    }

    async fn finalize(
        &self,
        lease: &LeaseInfo,
        outputs: Option<BTreeMap<String, Value>>,
        template_hash: Option<&str>,
        entry: HistoryEntry,
    ) -> Result<u64> {
        self.mutate(lease, move |snapshot| {
            apply_finalize(snapshot, outputs, template_hash, entry);
        })
        .await
    }

    async fn release(&self, lease: &LeaseInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lease.as_ref().is_some_and(|held| held.lease_id == lease.lease_id) {
            inner.lease = None;
        }
        Ok(())
    }

    async fn lease_info(&self) -> Result<Option<LeaseInfo>> {
        Ok(self.inner.lock().await.lease.clone())
    }

    async fn force_release(&self) -> Result<()> {
        self.inner.lock().await.lease = None;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StateError, StrataError};

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let store = MemoryStateStore::new();

        let lease = store.begin("a", 0).await.unwrap();
        assert!(store.begin("b", 0).await.is_err());

        store.release(&lease).await.unwrap();
        assert!(store.lease_info().await.unwrap().is_none());
        assert!(store.begin("b", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_released_lease_cannot_commit() {
        let store = MemoryStateStore::new();
        let lease = store.begin("a", 0).await.unwrap();
        store.release(&lease).await.unwrap();

        let err = store.remove(&lease, "Anything").await.unwrap_err();
        assert!(matches!(err, StrataError::State(StateError::LeaseNotHeld { .. })));
    }
}
