//! Undoing a failed run.
//!
//! The executor journals every successful step. Rollback walks the journal
//! backwards and re-applies the pre-plan snapshot for each touched resource:
//! created resources are deleted, updated ones reverted, deleted ones
//! recreated. Rollback runs one operation at a time and retries each one up
//! to the provider's retry cap.
//!
//! A recreated resource comes back under a new physical id. Rollback keeps a
//! map from the old id and attribute values to the new ones, rewrites later
//! recreates and reverts through it, and finally updates any resource left in
//! state that still points at an old value.

use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StepFailure};
use crate::provider::{Operation, OperationDriver, ProviderOutput, ProviderRegistry, ProviderSchema};
use crate::state::{LeaseInfo, PhysicalResource, StateStore};
use crate::template::{Properties, Value};

use super::graph::DependencyGraph;

/// A successful step, recorded for rollback.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    /// A resource was created.
    Created {
        /// The created record.
        record: PhysicalResource,
    },
    /// A resource was updated in place.
    Updated {
        /// Record before the update.
        previous: PhysicalResource,
        /// Record after the update.
        applied: PhysicalResource,
    },
    /// The new instance of a replaced resource was created.
    ReplacementCreated {
        /// Record of the old instance.
        previous: PhysicalResource,
        /// Record of the new instance.
        created: PhysicalResource,
        /// Whether the old instance was already deleted.
        previous_deleted: bool,
    },
    /// The old instance of a replaced resource was deleted.
    ReplacedDeleted {
        /// Record of the old instance.
        previous: PhysicalResource,
        /// Whether this happened before the new instance existed.
        before_create: bool,
    },
    /// A resource was deleted or forgotten.
    Deleted {
        /// Record before the delete.
        previous: PhysicalResource,
        /// Whether the resource was retained rather than deleted.
        retained: bool,
    },
}

impl JournalEntry {
    /// Logical name of the resource the entry is about.
    #[must_use]
    pub fn logical_name(&self) -> &str {
        match self {
            Self::Created { record } => &record.logical_name,
            Self::Updated { previous, .. }
            | Self::ReplacementCreated { previous, .. }
            | Self::ReplacedDeleted { previous, .. }
            | Self::Deleted { previous, .. } => &previous.logical_name,
        }
    }
}

/// Outcome of a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Operations that exhausted their retries.
    pub failures: Vec<StepFailure>,
    /// Resources left in an indeterminate state.
    pub indeterminate: Vec<String>,
    /// Resources restored to their pre-plan record.
    pub restored: Vec<String>,
}

impl RollbackReport {
    /// Returns true if every journaled step was undone.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, resource: &str, operation: &str, message: impl Into<String>) {
        let message = message.into();
        error!("Rollback of {} failed: {}", resource, message);
        self.failures.push(StepFailure {
            resource: resource.to_string(),
            operation: operation.to_string(),
            message,
        });
        if !self.indeterminate.iter().any(|r| r == resource) {
            self.indeterminate.push(resource.to_string());
        }
    }

    fn mark_restored(&mut self, resource: &str) {
        if !self.restored.iter().any(|r| r == resource) {
            self.restored.push(resource.to_string());
        }
    }
}

/// Old string values of recreated resources and their replacements.
#[derive(Debug, Default)]
struct Remap {
    /// Longest old value first, so a value is never rewritten through a
    /// shorter one it contains.
    values: Vec<(String, String)>,
}

impl Remap {
    /// Records what the ids and attributes of `old` became in `new`.
    fn record(&mut self, old: &PhysicalResource, new: &PhysicalResource) {
        self.insert(&old.physical_id, &new.physical_id);
        for (key, before) in &old.attributes {
            if let (Some(before), Some(after)) = (before.as_str(), new.attributes.get(key).and_then(Value::as_str)) {
                self.insert(before, after);
            }
        }
    }

    fn insert(&mut self, old: &str, new: &str) {
        if old.is_empty() || old == new || self.values.iter().any(|(o, _)| o == old) {
            return;
        }
        debug!("Rollback rewrites {} to {}", old, new);
        self.values.push((old.to_string(), new.to_string()));
        self.values.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn properties(&self, properties: &Properties) -> Properties {
        properties.iter().map(|(k, v)| (k.clone(), self.value(v))).collect()
    }

    fn value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.string(s)),
            Value::List(items) => Value::List(items.iter().map(|v| self.value(v)).collect()),
            Value::Map(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), self.value(v))).collect()),
            other => other.clone(),
        }
    }

    /// Replaces whole-token occurrences of old values. A match followed by
    /// an alphanumeric character is part of a longer token and stays.
    fn string(&self, s: &str) -> String {
        let mut out = s.to_string();
        for (old, new) in &self.values {
            let mut rewritten = String::with_capacity(out.len());
            let mut rest = out.as_str();
            while let Some(at) = rest.find(old.as_str()) {
                let after = &rest[at + old.len()..];
                rewritten.push_str(&rest[..at]);
                if after.chars().next().is_some_and(char::is_alphanumeric) {
                    rewritten.push_str(old);
                } else {
                    rewritten.push_str(new);
                }
                rest = after;
            }
            rewritten.push_str(rest);
            out = rewritten;
        }
        out
    }
}

/// Runs rollbacks.
#[derive(Debug, Clone, Copy)]
pub struct Rollback<'a> {
    registry: &'a ProviderRegistry,
    schemas: &'a BTreeMap<String, ProviderSchema>,
    driver: OperationDriver,
}

impl<'a> Rollback<'a> {
    /// Creates a rollback runner.
    #[must_use]
    pub const fn new(
        registry: &'a ProviderRegistry,
        schemas: &'a BTreeMap<String, ProviderSchema>,
        driver: OperationDriver,
    ) -> Self {
        Self {
            registry,
            schemas,
            driver,
        }
    }

    /// Undoes the journal in reverse order.
    ///
    /// Provider and state store failures are collected in the report;
    /// rollback continues with the remaining entries.
    pub async fn run(&self, journal: &[JournalEntry], store: &dyn StateStore, lease: &LeaseInfo) -> RollbackReport {
        info!("Rolling back {} steps", journal.len());
        let mut report = RollbackReport::default();
        let mut remap = Remap::default();
        // Old instances recreated while their replacement still exists.
        let mut recreated: BTreeMap<String, PhysicalResource> = BTreeMap::new();
        let mut lost: HashSet<String> = HashSet::new();

        for entry in journal.iter().rev() {
            let name = entry.logical_name().to_string();
            match entry {
                JournalEntry::Created { record } => {
                    if self.delete(record, &mut report).await && remove(store, lease, &name, &mut report).await {
                        report.mark_restored(&name);
                    }
                }
                JournalEntry::Updated { previous, applied } => {
                    let properties = remap.properties(&previous.properties);
                    let operation = Operation::Update {
                        physical_id: &applied.physical_id,
                        previous: &applied.properties,
                        properties: &properties,
                    };
                    if let Some(output) = self.call(previous, operation, &mut report).await {
                        let record = restore(previous, &previous.physical_id, properties, output);
                        remap.record(previous, &record);
                        if commit(store, lease, record, &mut report).await {
                            report.mark_restored(&name);
                        }
                    }
                }
                JournalEntry::ReplacedDeleted { previous, before_create } => {
                    match self.recreate(previous, &remap, &mut report).await {
                        Some(record) => {
                            remap.record(previous, &record);
                            if *before_create {
                                if commit(store, lease, record, &mut report).await {
                                    report.mark_restored(&name);
                                }
                            } else {
                                recreated.insert(name, record);
                            }
                        }
                        None => {
                            lost.insert(name);
                        }
                    }
                }
                JournalEntry::ReplacementCreated { previous, created, previous_deleted } => {
                    if !self.delete(created, &mut report).await {
                        continue;
                    }
                    let restored = if let Some(record) = recreated.remove(&name) {
                        commit(store, lease, record, &mut report).await
                    } else if *previous_deleted || lost.contains(&name) {
                        remove(store, lease, &name, &mut report).await;
                        continue;
                    } else {
                        commit(store, lease, previous.clone(), &mut report).await
                    };
                    if restored {
                        report.mark_restored(&name);
                    }
                }
                JournalEntry::Deleted { previous, retained } => {
                    if *retained {
                        if commit(store, lease, previous.clone(), &mut report).await {
                            report.mark_restored(&name);
                        }
                    } else if let Some(record) = self.recreate(previous, &remap, &mut report).await {
                        remap.record(previous, &record);
                        if commit(store, lease, record, &mut report).await {
                            report.mark_restored(&name);
                        }
                    }
                }
            }
        }

        if !remap.is_empty() {
            self.rewire(&mut remap, store, lease, &mut report).await;
        }

        if report.is_complete() {
            info!("Rollback complete, {} resources restored", report.restored.len());
        } else {
            warn!(
                "Rollback incomplete, indeterminate: {}",
                report.indeterminate.join(", ")
            );
        }
        report
    }

    /// Updates every resource in state that still refers to a value a
    /// recreate replaced, dependencies first.
    async fn rewire(&self, remap: &mut Remap, store: &dyn StateStore, lease: &LeaseInfo, report: &mut RollbackReport) {
        let snapshot = match store.load().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                report.fail("state", "load", e.to_string());
                return;
            }
        };

        let graph = DependencyGraph::from_state(&snapshot);
        for name in graph.order() {
            let Some(record) = snapshot.get(name) else {
                continue;
            };
            let properties = remap.properties(&record.properties);
            if properties == record.properties {
                continue;
            }

            info!("Rollback: rewiring {} to recreated resources", name);
            let operation = Operation::Update {
                physical_id: &record.physical_id,
                previous: &record.properties,
                properties: &properties,
            };
            if let Some(output) = self.call(record, operation, report).await {
                let rewired = restore(record, &record.physical_id, properties, output);
                remap.record(record, &rewired);
                if commit(store, lease, rewired, report).await {
                    report.mark_restored(name);
                }
            }
        }
    }

    async fn delete(&self, record: &PhysicalResource, report: &mut RollbackReport) -> bool {
        let operation = Operation::Delete {
            physical_id: &record.physical_id,
        };
        self.call(record, operation, report).await.is_some()
    }

    async fn recreate(
        &self,
        previous: &PhysicalResource,
        remap: &Remap,
        report: &mut RollbackReport,
    ) -> Option<PhysicalResource> {
        let properties = remap.properties(&previous.properties);
        let operation = Operation::Create {
            logical_name: &previous.logical_name,
            properties: &properties,
        };
        let output = self.call(previous, operation, report).await?;
        let physical_id = output.physical_id.clone().unwrap_or_else(|| previous.physical_id.clone());
        Some(restore(previous, &physical_id, properties, output))
    }

    async fn call(
        &self,
        record: &PhysicalResource,
        operation: Operation<'_>,
        report: &mut RollbackReport,
    ) -> Option<ProviderOutput> {
        let provider = match self.registry.provider_for(&record.logical_name, &record.resource_type) {
            Ok(provider) => provider,
            Err(e) => {
                report.fail(&record.logical_name, operation.name(), e.to_string());
                return None;
            }
        };
        let schema = self.schemas.get(&record.resource_type).cloned().unwrap_or_default();

        info!("Rollback: {} {}", operation.name(), record.logical_name);
        match self
            .driver
            .run_with_retries(provider.as_ref(), &record.resource_type, &schema, &record.logical_name, operation)
            .await
        {
            Ok(output) => Some(output),
            Err(e) => {
                report.fail(&record.logical_name, operation.name(), e.to_string());
                None
            }
        }
    }
}

async fn commit(store: &dyn StateStore, lease: &LeaseInfo, record: PhysicalResource, report: &mut RollbackReport) -> bool {
    let name = record.logical_name.clone();
    written(store.commit(lease, record).await, &name, "commit", report)
}

async fn remove(store: &dyn StateStore, lease: &LeaseInfo, name: &str, report: &mut RollbackReport) -> bool {
    written(store.remove(lease, name).await, name, "remove", report)
}

fn written(result: Result<u64>, name: &str, operation: &str, report: &mut RollbackReport) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            report.fail(name, operation, format!("recording state failed: {e}"));
            false
        }
    }
}

fn restore(
    previous: &PhysicalResource,
    physical_id: &str,
    properties: Properties,
    output: ProviderOutput,
) -> PhysicalResource {
    let mut record = previous.clone();
    record.physical_id = physical_id.to_string();
    record.properties = properties;
    if !output.attributes.is_empty() {
        record.attributes = output.attributes;
    }
    record.updated_at = Utc::now();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ResourceProvider;
    use crate::provider::testing::ScriptedProvider;
    use crate::state::{MemoryStateStore, StateSnapshot};
    use crate::template::DeletionPolicy;
    use std::sync::Arc;

    fn record(name: &str, physical_id: &str, port: i64) -> PhysicalResource {
        PhysicalResource {
            logical_name: name.to_string(),
            resource_type: String::from("Test::Target::Group"),
            physical_id: physical_id.to_string(),
            properties: [(String::from("Port"), Value::integer(port))].into_iter().collect(),
            attributes: Properties::new(),
            dependencies: Vec::new(),
            index: 0,
            deletion_policy: DeletionPolicy::Delete,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_undoing_replacement_restores_recreated_old_instance() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = ProviderRegistry::new().with_fallback(provider.clone());
        let schemas = BTreeMap::new();

        let created = provider
            .create("Test::Target::Group", "TargetGroup", &record("TargetGroup", "", 8080).properties)
            .await
            .unwrap();
        let crate::provider::ProviderResponse::Done(output) = created else {
            panic!("scripted provider completes immediately");
        };
        let new_id = output.physical_id.unwrap();

        let previous = record("TargetGroup", "targetgroup-old", 80);
        let current = record("TargetGroup", &new_id, 8080);
        let mut snapshot = StateSnapshot::new();
        snapshot.set(current.clone());
        let store = MemoryStateStore::with_snapshot(snapshot);
        let lease = store.begin("test", 1).await.unwrap();

        let journal = vec![
            JournalEntry::ReplacementCreated {
                previous: previous.clone(),
                created: current,
                previous_deleted: false,
            },
            JournalEntry::ReplacedDeleted {
                previous,
                before_create: false,
            },
        ];

        let report = Rollback::new(&registry, &schemas, OperationDriver::default())
            .run(&journal, &store, &lease)
            .await;
        assert!(report.is_complete());
        assert_eq!(report.restored, ["TargetGroup"]);

        let restored = store.load().await.unwrap().get("TargetGroup").cloned().unwrap();
        assert_eq!(restored.properties["Port"], Value::integer(80));
        assert_ne!(restored.physical_id, new_id);

        let live = provider.resources();
        assert_eq!(live.len(), 1);
        assert!(live.contains_key(&restored.physical_id));
    }

    #[test]
    fn test_remap_rewrites_whole_tokens_only() {
        let mut remap = Remap::default();
        remap.insert("targetgroup-1", "targetgroup-3");
        remap.insert("arn:test:targetgroup-1", "arn:test:targetgroup-3");

        assert_eq!(remap.string("arn:test:targetgroup-1"), "arn:test:targetgroup-3");
        assert_eq!(remap.string("targetgroup-1/listener"), "targetgroup-3/listener");
        assert_eq!(remap.string("targetgroup-12"), "targetgroup-12");

        let nested = Value::List(vec![Value::string("targetgroup-1"), Value::integer(1)]);
        assert_eq!(
            remap.value(&nested),
            Value::List(vec![Value::string("targetgroup-3"), Value::integer(1)])
        );
    }
}
