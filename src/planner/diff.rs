//! Diff engine for comparing desired properties with the prior snapshot.
//!
//! This module classifies a single logical resource as Create, Update,
//! Replace, Delete or NoOp, and lists the fields that changed along with
//! whether each one forces replacement under the provider schema.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

use crate::provider::ProviderSchema;
use crate::state::PhysicalResource;
use crate::template::{Properties, Value};

/// Pseudo-field reported when the resource type itself changed.
pub const TYPE_FIELD: &str = "Type";

/// Engine for computing per-resource diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Kind of planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be replaced.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

impl ActionKind {
    /// Returns true if the action touches the provider.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Symbol used in rendered plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{name}")
    }
}

/// A single changed field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Field that differs.
    pub field: String,
    /// Old value.
    pub before: Option<Value>,
    /// New value. `Value::Unknown` when only known after apply.
    pub after: Option<Value>,
    /// Whether this change forces replacement.
    pub replacement: bool,
}

/// Result of diffing one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    /// Action kind.
    pub kind: ActionKind,
    /// Changed fields, sorted by name.
    pub changes: Vec<FieldChange>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classifies a resource against its prior record.
    ///
    /// A field whose desired value is not yet known counts as changed.
    #[must_use]
    pub fn classify(
        &self,
        prior: Option<&PhysicalResource>,
        resource_type: &str,
        desired: &Properties,
        schema: &ProviderSchema,
    ) -> ResourceDiff {
        let Some(prior) = prior else {
            return ResourceDiff {
                kind: ActionKind::Create,
                changes: Vec::new(),
            };
        };

        let mut changes = self.changed_fields(&prior.properties, desired, schema);

        if prior.resource_type != resource_type {
            debug!(
                "{} changed type {} -> {}",
                prior.logical_name, prior.resource_type, resource_type
            );
            changes.insert(
                0,
                FieldChange {
                    field: TYPE_FIELD.to_string(),
                    before: Some(Value::string(prior.resource_type.as_str())),
                    after: Some(Value::string(resource_type)),
                    replacement: true,
                },
            );
        }

        let kind = if changes.is_empty() {
            ActionKind::NoOp
        } else if changes.iter().any(|c| c.replacement) {
            ActionKind::Replace
        } else {
            ActionKind::Update
        };

        ResourceDiff { kind, changes }
    }

    /// Lists the fields that differ between two property mappings.
    #[must_use]
    pub fn changed_fields(
        &self,
        before: &Properties,
        after: &Properties,
        schema: &ProviderSchema,
    ) -> Vec<FieldChange> {
        let fields: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

        fields
            .into_iter()
            .filter_map(|field| {
                let old = before.get(field);
                let new = after.get(field);
                let changed = match (old, new) {
                    (Some(o), Some(n)) => !n.is_known() || o != n,
                    (None, None) => false,
                    _ => true,
                };
                changed.then(|| FieldChange {
                    field: field.clone(),
                    before: old.cloned(),
                    after: new.cloned(),
                    replacement: schema.requires_replacement(field),
                })
            })
            .collect()
    }
}
