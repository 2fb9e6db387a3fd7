//! State types for tracking applied resources.
//!
//! These types are the recorded state of a stack, used as the prior snapshot
//! when planning and restored from when rolling back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::template::{DeletionPolicy, Properties, Value};

/// Current version of the state format.
pub const STATE_FORMAT: &str = "1.0";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The recorded state of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub format: String,
    /// Monotonic version token, bumped by every mutation.
    pub version: u64,
    /// Applied resources by logical name.
    pub resources: BTreeMap<String, PhysicalResource>,
    /// Outputs resolved after the last successful apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Hash of the last applied template source.
    #[serde(default)]
    pub template_hash: String,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSnapshot {
    /// Creates an empty snapshot at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            format: STATE_FORMAT.to_string(),
            version: 0,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            template_hash: String::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PhysicalResource> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource and bumps the version.
    pub fn set(&mut self, resource: PhysicalResource) {
        self.resources.insert(resource.logical_name.clone(), resource);
        self.touch();
    }

    /// Removes a resource and bumps the version.
    pub fn remove(&mut self, name: &str) -> Option<PhysicalResource> {
        let removed = self.resources.remove(name);
        self.touch();
        removed
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Bumps the version token.
    pub fn touch(&mut self) {
        self.version += 1;
        self.last_updated = Utc::now();
    }
}

/// A resource as last applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalResource {
    /// Logical name in the template.
    pub logical_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Last-applied properties.
    pub properties: Properties,
    /// Provider-reported attributes.
    #[serde(default)]
    pub attributes: Properties,
    /// Resources this one depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Declaration index when applied, used to order deletes.
    #[serde(default)]
    pub index: usize,
    /// Deletion policy when applied.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: HistoryOperation,
    /// Template hash at the time of the run.
    pub template_hash: String,
    /// Resources changed by the run.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

impl HistoryEntry {
    /// Creates an entry timestamped now.
    #[must_use]
    pub fn new(operation: HistoryOperation, template_hash: impl Into<String>, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            template_hash: template_hash.into(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Template apply.
    Apply,
    /// Stack destruction.
    Destroy,
    /// Rollback after a failed run.
    Rollback,
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}
