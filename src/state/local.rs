//! Local file-based state storage backend.
//!
//! State lives in `state.json` and the lease in `state.lease`, both under a
//! base directory. Writes go to a uniquely named temporary file that is
//! renamed into place. A lease is acquired by hard-linking its fully written
//! temporary file to `state.lease`, which fails if any process holds one.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, StrataError};
use crate::template::Value;

use super::lease::{LEASE_TTL_SECS, LeaseInfo, generate_holder_id};
use super::store::{StateStore, apply_finalize, check_begin, check_lease};
use super::types::{HistoryEntry, PhysicalResource, STATE_FORMAT, StateSnapshot};

/// Default state directory name.
const STATE_DIR: &str = ".strata";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lease file name.
const LEASE_FILE: &str = "state.lease";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lease file.
    lease_path: PathBuf,
    /// Lease lifetime.
    lease_ttl_secs: i64,
    /// Serializes read-modify-write cycles within this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `.strata` in the current
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StrataError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lease_path = base_dir.join(LEASE_FILE);

        Self {
            base_dir,
            state_path,
            lease_path,
            lease_ttl_secs: LEASE_TTL_SECS,
            write_guard: Mutex::new(()),
        }
    }

    /// Sets the lease lifetime.
    #[must_use]
    pub const fn with_lease_ttl(mut self, ttl_secs: i64) -> Self {
        self.lease_ttl_secs = ttl_secs;
        self
    }

    /// Path to the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::storage(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes a JSON document to a fresh temporary file next to `path`.
    async fn write_temp<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<PathBuf> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {}: {e}", path.display())))?;

        let temp_path = temp_path(path);
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync {}: {e}", temp_path.display())))?;
        Ok(temp_path)
    }

    /// Writes a JSON document atomically.
    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let temp_path = self.write_temp(path, value).await?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            discard(&temp_path).await;
            return Err(StateError::storage(format!("Failed to rename {}: {e}", path.display())).into());
        }
        Ok(())
    }

    /// Publishes `lease` unless a lease file already exists.
    async fn try_create_lease(&self, lease: &LeaseInfo) -> Result<bool> {
        let temp_path = self.write_temp(&self.lease_path, lease).await?;
        let linked = fs::hard_link(&temp_path, &self.lease_path).await;
        discard(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StateError::storage(format!("Failed to create lease file: {e}")).into()),
        }
    }

    /// Moves the expired lease aside. Returns false, leaving the lease file
    /// in place, if another process replaced it after it was read.
    async fn take_over(&self, expired: &LeaseInfo) -> Result<bool> {
        let aside = self.base_dir.join(format!("{LEASE_FILE}.{}.stale", Uuid::new_v4().simple()));
        match fs::rename(&self.lease_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(StateError::storage(format!("Failed to move expired lease aside: {e}")).into());
            }
        }

        let moved = read_lease_file(&aside).await?;
        if moved.as_ref().is_some_and(|m| m.lease_id == expired.lease_id) {
            discard(&aside).await;
            info!("Took over expired lease of {}", expired.holder);
            return Ok(true);
        }

        if let Err(e) = fs::hard_link(&aside, &self.lease_path).await {
            warn!("Could not put back a replaced lease: {}", e);
        }
        discard(&aside).await;
        Ok(false)
    }

    async fn read_snapshot(&self) -> Result<StateSnapshot> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(StateSnapshot::new());
        }

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            StrataError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            StrataError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if snapshot.format != STATE_FORMAT {
            return Err(StrataError::State(StateError::VersionMismatch {
                expected: STATE_FORMAT.to_string(),
                found: snapshot.format,
            }));
        }

        Ok(snapshot)
    }

    async fn read_lease(&self) -> Result<Option<LeaseInfo>> {
        read_lease_file(&self.lease_path).await
    }

    async fn delete_lease(&self) -> Result<()> {
        match fs::remove_file(&self.lease_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(StateError::storage(format!("Failed to delete lease file: {e}")).into())
            }
            _ => Ok(()),
        }
    }

    /// Applies a mutation under the lease and advances the lease version.
    async fn mutate(&self, lease: &LeaseInfo, apply: impl FnOnce(&mut StateSnapshot) + Send) -> Result<u64> {
        let _guard = self.write_guard.lock().await;

        let mut snapshot = self.read_snapshot().await?;
        let mut held = self.read_lease().await?;
        check_lease(&snapshot, held.as_ref(), lease)?;

        apply(&mut snapshot);
        self.write_json(&self.state_path, &snapshot).await?;

        if let Some(held) = held.as_mut() {
            held.version = snapshot.version;
            self.write_json(&self.lease_path, held).await?;
        }

        debug!("State committed at version {}", snapshot.version);
        Ok(snapshot.version)
    }
}

/// Unique temporary file name for a write to `path`.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| String::from("state"), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

async fn read_lease_file(path: &Path) -> Result<Option<LeaseInfo>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StrataError::State(StateError::Corrupted {
                message: format!("Failed to read lease file: {e}"),
            }));
        }
    };

    let lease = serde_json::from_str(&content).map_err(|e| {
        StrataError::State(StateError::Corrupted {
            message: format!("Failed to parse lease file: {e}"),
        })
    })?;
    Ok(Some(lease))
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        info!("Loading state from: {}", self.state_path.display());
        self.read_snapshot().await
    }

    async fn begin(&self, holder: &str, expected_version: u64) -> Result<LeaseInfo> {
        let _guard = self.write_guard.lock().await;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lease = LeaseInfo::new(&holder_id, expected_version, self.lease_ttl_secs);

        if !self.try_create_lease(&lease).await? {
            let snapshot = self.read_snapshot().await?;
            let existing = self.read_lease().await?;
            check_begin(&snapshot, existing.as_ref(), expected_version)?;

            let taken = match &existing {
                Some(expired) => self.take_over(expired).await?,
                None => true,
            };
            if !taken || !self.try_create_lease(&lease).await? {
                let holder = self.read_lease().await?.map(|l| l.holder);
                return Err(StrataError::State(StateError::ConcurrentModification {
                    expected: expected_version,
                    found: snapshot.version,
                    holder,
                }));
            }
        }

        let snapshot = self.read_snapshot().await?;
        if snapshot.version != expected_version {
            self.delete_lease().await?;
            return Err(StrataError::State(StateError::ConcurrentModification {
                expected: expected_version,
                found: snapshot.version,
                holder: None,
            }));
        }

        info!(
            "Acquired state lease: {} at version {} (expires in {}s)",
            lease.lease_id, lease.version, self.lease_ttl_secs
        );
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
        let _guard = self.write_guard.lock().await;

        match self.read_lease().await? {
            Some(existing) if existing.lease_id == lease.lease_id => {
                self.delete_lease().await?;
                info!("Released state lease: {}", lease.lease_id);
            }
            Some(existing) => {
                warn!(
                    "Lease ID mismatch: expected {}, found {}",
                    lease.lease_id, existing.lease_id
                );
            }
            None => {}
        }
        Ok(())
    }

    async fn lease_info(&self) -> Result<Option<LeaseInfo>> {
        self.read_lease().await
    }

    async fn force_release(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        warn!("Force-releasing state lease at: {}", self.lease_path.display());
        self.delete_lease().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HistoryOperation;
    use crate::template::{DeletionPolicy, Properties};
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn resource(name: &str) -> PhysicalResource {
        PhysicalResource {
            logical_name: name.to_string(),
            resource_type: String::from("AWS::SQS::Queue"),
            physical_id: format!("queue-{name}"),
            properties: Properties::new(),
            attributes: Properties::new(),
            dependencies: Vec::new(),
            index: 0,
            deletion_policy: DeletionPolicy::Delete,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_nonexistent_is_empty() {
        let (store, _temp) = create_test_store();
        let snapshot = store.load().await.expect("Load should not fail");
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn test_commit_persists_and_bumps_version() {
        let (store, temp) = create_test_store();

        let lease = store.begin("tester", 0).await.expect("Failed to begin");
        let v1 = store.commit(&lease, resource("Queue")).await.expect("Failed to commit");
        assert_eq!(v1, 1);
        let v2 = store
            .finalize(&lease, Some(BTreeMap::new()), Some("abc"), HistoryEntry::new(HistoryOperation::Apply, "abc", vec![]))
            .await
            .expect("Failed to finalize");
        assert_eq!(v2, 2);
        store.release(&lease).await.expect("Failed to release");

        let reopened = LocalStateStore::with_base_dir(temp.path());
        let snapshot = reopened.load().await.expect("Failed to load");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.get("Queue").map(|r| r.physical_id.as_str()), Some("queue-Queue"));
        assert_eq!(snapshot.template_hash, "abc");
        assert!(reopened.lease_info().await.expect("lease_info failed").is_none());
    }

    #[tokio::test]
    async fn test_second_writer_is_rejected() {
        let (store, _temp) = create_test_store();

        let _lease = store.begin("holder-1", 0).await.expect("Failed to begin");
        let err = store.begin("holder-2", 0).await.unwrap_err();
        assert!(matches!(
            err,
            StrataError::State(StateError::ConcurrentModification { holder: Some(ref h), .. }) if h == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let (store, _temp) = create_test_store();

        let lease = store.begin("first", 0).await.expect("Failed to begin");
        store.commit(&lease, resource("Queue")).await.expect("Failed to commit");
        store.release(&lease).await.expect("Failed to release");

        let err = store.begin("second", 0).await.unwrap_err();
        assert!(matches!(err, StrataError::State(StateError::ConcurrentModification { found: 1, .. })));
    }

    #[tokio::test]
    async fn test_concurrent_begins_admit_one_holder() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let first = LocalStateStore::with_base_dir(temp.path());
        let second = LocalStateStore::with_base_dir(temp.path());

        let (a, b) = tokio::join!(first.begin("first", 0), second.begin("second", 0));
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);

        let winner = a.or(b).expect("one begin succeeds");
        let held = first.lease_info().await.expect("lease_info failed").expect("lease is held");
        assert_eq!(held.lease_id, winner.lease_id);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (store, temp) = create_test_store();
        let crashed = LocalStateStore::with_base_dir(temp.path()).with_lease_ttl(-1);
        let old = crashed.begin("crashed", 0).await.expect("Failed to begin");

        let lease = store.begin("next", 0).await.expect("Expired lease should be taken over");
        assert_ne!(lease.lease_id, old.lease_id);

        let err = crashed.commit(&old, resource("Queue")).await.unwrap_err();
        assert!(matches!(err, StrataError::State(StateError::LeaseNotHeld { .. })));
        assert_eq!(store.commit(&lease, resource("Queue")).await.expect("Failed to commit"), 1);

        let leftovers: Vec<String> = std::fs::read_dir(temp.path())
            .expect("Failed to list state dir")
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp") || name.ends_with(".stale"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_temp_files_are_unique_per_write() {
        let state = Path::new("/tmp/strata/state.json");
        let first = temp_path(state);
        assert_ne!(first, temp_path(state));
        assert_eq!(first.parent(), state.parent());

        let name = first.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with(".state.json.") && name.ends_with(".tmp"));
        assert_ne!(
            temp_path(Path::new("/tmp/strata/state.lease")).file_name(),
            first.file_name()
        );
    }

    #[tokio::test]
    async fn test_force_release_invalidates_lease() {
        let (store, _temp) = create_test_store();

        let lease = store.begin("stuck", 0).await.expect("Failed to begin");
        store.force_release().await.expect("Failed to force release");

        let err = store.commit(&lease, resource("Queue")).await.unwrap_err();
        assert!(matches!(err, StrataError::State(StateError::LeaseNotHeld { .. })));
        assert!(store.begin("next", 0).await.is_ok());
    }
}
