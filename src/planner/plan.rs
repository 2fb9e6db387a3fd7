//! Plan types and construction.
//!
//! A [`Plan`] is a pure function of the template, the parameter overrides and
//! the prior snapshot. It carries the per-resource actions for rendering and
//! a step DAG for the executor. Steps reference each other by index; a step
//! may start only after every step it depends on has succeeded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::provider::{ProviderSchema, ReplacementStrategy};
use crate::resolver::{
    ConditionEvaluator, ConditionValues, ParameterResolver, PseudoParameters, ResolveContext,
    ResolvedParameters, Resolver, ResourceBinding, ResourceLookup,
};
use crate::state::{PhysicalResource, StateSnapshot};
use crate::template::{DeletionPolicy, Properties, Reference, Template, TemplateHasher, Value};

use super::diff::{ActionKind, DiffEngine, FieldChange};
use super::graph::DependencyGraph;

/// What a plan does as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Converge the stack to a template.
    Apply,
    /// Delete every resource in state.
    Destroy,
}

/// A single planned action, for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    /// Logical resource name.
    pub logical_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Action kind.
    pub kind: ActionKind,
    /// Last-applied properties.
    pub before: Option<Properties>,
    /// Desired properties, possibly containing unknown values.
    pub after: Option<Properties>,
    /// Changed fields.
    pub changes: Vec<FieldChange>,
    /// Existing physical id.
    pub physical_id: Option<String>,
    /// Replacement ordering, for replace actions.
    pub strategy: Option<ReplacementStrategy>,
    /// Hash of the desired properties.
    pub properties_hash: Option<String>,
}

/// Operation performed by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOperation {
    /// Create a resource that is not in state.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource that left the template, or forget it if retained.
    Delete {
        /// Forget without calling the provider.
        retain: bool,
    },
    /// Create the new instance of a replaced resource.
    CreateReplacement,
    /// Delete the old instance of a replaced resource.
    DeleteReplaced,
}

impl std::fmt::Display for StepOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete { retain: false } => write!(f, "delete"),
            Self::Delete { retain: true } => write!(f, "retain"),
            Self::CreateReplacement => write!(f, "create replacement"),
            Self::DeleteReplaced => write!(f, "delete replaced"),
        }
    }
}

/// A node of the execution DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStep {
    /// Index of this step in [`Plan::steps`].
    pub id: usize,
    /// Logical resource name.
    pub logical_name: String,
    /// Resource type the operation is issued against.
    pub resource_type: String,
    /// Operation.
    pub operation: StepOperation,
    /// Steps that must succeed first.
    pub depends_on: Vec<usize>,
}

/// Everything needed to re-resolve properties at execution time.
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// The template the plan was built from.
    pub template: Arc<Template>,
    /// Resolved parameters.
    pub parameters: ResolvedParameters,
    /// Evaluated conditions.
    pub conditions: ConditionValues,
    /// Pseudo-parameters.
    pub pseudo: PseudoParameters,
    /// Dependency graph over active resources.
    pub graph: DependencyGraph,
}

impl PlanContext {
    /// Resolves outputs whose guard holds against applied records.
    ///
    /// # Errors
    ///
    /// Returns an error if an output expression cannot be resolved.
    pub fn outputs(&self, records: &BTreeMap<String, PhysicalResource>) -> Result<BTreeMap<String, Value>, ValidationError> {
        let lookup = StateLookup::new(&self.template, &self.graph, records);
        Self::outputs_with(&self.template, &self.parameters, &self.conditions, &self.pseudo, &lookup)
    }

    fn outputs_with(
        template: &Template,
        parameters: &ResolvedParameters,
        conditions: &ConditionValues,
        pseudo: &PseudoParameters,
        lookup: &dyn ResourceLookup,
    ) -> Result<BTreeMap<String, Value>, ValidationError> {
        let resolver = Resolver::new(ResolveContext {
            parameters,
            conditions,
            pseudo,
            resources: lookup,
        });

        let mut outputs = BTreeMap::new();
        for (name, output) in &template.outputs {
            if let Some(guard) = &output.condition
                && conditions.get(guard) != Some(true)
            {
                continue;
            }
            if let Some(value) = resolver.resolve(&output.value, &format!("Outputs.{name}.Value"))? {
                outputs.insert(name.clone(), value);
            }
        }
        Ok(outputs)
    }
}

/// Counts of actions by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub creates: usize,
    /// Resources to update in place.
    pub updates: usize,
    /// Resources to replace.
    pub replaces: usize,
    /// Resources to delete.
    pub deletes: usize,
    /// Unchanged resources.
    pub unchanged: usize,
}

/// A complete plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Apply or destroy.
    pub kind: PlanKind,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the template source the plan was built from.
    pub template_hash: String,
    /// State version the plan was computed against.
    pub state_version: u64,
    /// Actions: active resources in dependency order, then deletes.
    pub actions: Vec<PlannedAction>,
    /// Execution DAG.
    pub steps: Vec<ExecutionStep>,
    /// Output values as far as they are known before apply.
    pub outputs: BTreeMap<String, Value>,
    /// Resolution context; `None` for destroy plans.
    pub context: Option<PlanContext>,
}

impl Plan {
    /// Gets the action for a resource.
    #[must_use]
    pub fn action(&self, logical_name: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.logical_name == logical_name)
    }

    /// Returns true if executing the plan would call any provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Counts actions by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Create => summary.creates += 1,
                ActionKind::Update => summary.updates += 1,
                ActionKind::Replace => summary.replaces += 1,
                ActionKind::Delete => summary.deletes += 1,
                ActionKind::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Names of resources the plan changes.
    #[must_use]
    pub fn changed_resources(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|a| a.kind.is_change())
            .map(|a| a.logical_name.clone())
            .collect()
    }
}

/// Resource bindings over a set of applied records.
///
/// Names in `pending` are being created or replaced and bind to unknown
/// values. Names in `updating` keep their physical id but their attributes
/// are unknown. Other active names bind to their record.
pub(crate) struct StateLookup<'a> {
    template: &'a Template,
    graph: &'a DependencyGraph,
    records: &'a BTreeMap<String, PhysicalResource>,
    pending: HashSet<String>,
    updating: HashSet<String>,
}

impl<'a> StateLookup<'a> {
    pub(crate) fn new(
        template: &'a Template,
        graph: &'a DependencyGraph,
        records: &'a BTreeMap<String, PhysicalResource>,
    ) -> Self {
        Self {
            template,
            graph,
            records,
            pending: HashSet::new(),
            updating: HashSet::new(),
        }
    }
}

impl ResourceLookup for StateLookup<'_> {
    fn binding(&self, name: &str) -> ResourceBinding<'_> {
        if !self.template.resources.contains_key(name) {
            return ResourceBinding::Undeclared;
        }
        if !self.graph.contains(name) {
            return ResourceBinding::Inactive;
        }
        if self.pending.contains(name) {
            return ResourceBinding::Pending;
        }
        match self.records.get(name) {
            Some(record) if self.updating.contains(name) => ResourceBinding::Updating {
                physical_id: &record.physical_id,
            },
            Some(record) => ResourceBinding::Known {
                physical_id: &record.physical_id,
                attributes: &record.attributes,
            },
            None => ResourceBinding::Pending,
        }
    }
}

/// Builds plans.
#[derive(Debug, Default, Clone, Copy)]
pub struct Planner {
    diff: DiffEngine,
    hasher: TemplateHasher,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            diff: DiffEngine::new(),
            hasher: TemplateHasher::new(),
        }
    }

    /// Plans converging `prior` to `template`.
    ///
    /// `schemas` must hold the provider schema of every resource type in the
    /// template.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found. No provider is called.
    pub fn plan(
        &self,
        template: Arc<Template>,
        template_hash: &str,
        overrides: &BTreeMap<String, String>,
        pseudo: &PseudoParameters,
        prior: &StateSnapshot,
        schemas: &BTreeMap<String, ProviderSchema>,
    ) -> Result<Plan, ValidationError> {
        let parameters = ParameterResolver::new().resolve(&template.parameters, overrides)?;
        let conditions = ConditionEvaluator::new().evaluate(&template, &parameters, pseudo)?;
        let graph = DependencyGraph::build(&template, &conditions, pseudo)?;
        Self::check_outputs(&template, &conditions, pseudo)?;

        let mut lookup = StateLookup::new(&template, &graph, &prior.resources);

        let mut actions = Vec::new();
        for name in graph.order() {
            let Some(decl) = template.resource(name) else {
                continue;
            };
            let schema = schemas.get(&decl.resource_type).ok_or_else(|| {
                ValidationError::UnknownResourceType {
                    resource: name.clone(),
                    resource_type: decl.resource_type.clone(),
                }
            })?;

            let ctx = ResolveContext {
                parameters: &parameters,
                conditions: &conditions,
                pseudo,
                resources: &lookup,
            };
            let desired = Resolver::new(ctx).resolve_properties(&format!("Resources.{name}.Properties"), &decl.properties)?;

            let record = prior.get(name);
            let diff = self.diff.classify(record, &decl.resource_type, &desired, schema);
            debug!("{}: {} ({} changed fields)", name, diff.kind, diff.changes.len());

            match diff.kind {
                ActionKind::Create | ActionKind::Replace => {
                    lookup.pending.insert(name.clone());
                }
                ActionKind::Update => {
                    lookup.updating.insert(name.clone());
                }
                ActionKind::Delete | ActionKind::NoOp => {}
            }

            actions.push(PlannedAction {
                logical_name: name.clone(),
                resource_type: decl.resource_type.clone(),
                kind: diff.kind,
                before: record.map(|r| r.properties.clone()),
                properties_hash: Some(self.hasher.hash_properties(&decl.resource_type, &desired)),
                after: Some(desired),
                changes: diff.changes,
                physical_id: record.map(|r| r.physical_id.clone()),
                strategy: (diff.kind == ActionKind::Replace).then_some(schema.replacement),
            });
        }

        let outputs = PlanContext::outputs_with(&template, &parameters, &conditions, pseudo, &lookup)?;

        let prior_graph = DependencyGraph::from_state(prior);
        for name in prior_graph.order().iter().rev() {
            if graph.contains(name) {
                continue;
            }
            if let Some(record) = prior.get(name) {
                actions.push(Self::delete_action(record));
            }
        }

        let steps = build_steps(&actions, &graph, &prior_graph, prior);
        let plan = Plan {
            kind: PlanKind::Apply,
            created_at: Utc::now(),
            template_hash: template_hash.to_string(),
            state_version: prior.version,
            actions,
            steps,
            outputs,
            context: Some(PlanContext {
                template,
                parameters,
                conditions,
                pseudo: pseudo.clone(),
                graph,
            }),
        };

        let summary = plan.summary();
        info!(
            "Planned {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            summary.creates, summary.updates, summary.replaces, summary.deletes, summary.unchanged
        );
        Ok(plan)
    }

    /// Plans deleting every resource in `prior`, dependents first.
    #[must_use]
    pub fn plan_destroy(&self, prior: &StateSnapshot) -> Plan {
        let prior_graph = DependencyGraph::from_state(prior);
        let actions: Vec<PlannedAction> = prior_graph
            .order()
            .iter()
            .rev()
            .filter_map(|name| prior.get(name))
            .map(Self::delete_action)
            .collect();

        let steps = build_steps(&actions, &DependencyGraph::default(), &prior_graph, prior);
        info!("Planned {} resources to delete", actions.len());

        Plan {
            kind: PlanKind::Destroy,
            created_at: Utc::now(),
            template_hash: prior.template_hash.clone(),
            state_version: prior.version,
            actions,
            steps,
            outputs: BTreeMap::new(),
            context: None,
        }
    }

    fn delete_action(record: &PhysicalResource) -> PlannedAction {
        PlannedAction {
            logical_name: record.logical_name.clone(),
            resource_type: record.resource_type.clone(),
            kind: ActionKind::Delete,
            before: Some(record.properties.clone()),
            after: None,
            changes: Vec::new(),
            physical_id: Some(record.physical_id.clone()),
            strategy: None,
            properties_hash: None,
        }
    }

    /// Checks that output expressions only reference things that exist.
    fn check_outputs(
        template: &Template,
        conditions: &ConditionValues,
        pseudo: &PseudoParameters,
    ) -> Result<(), ValidationError> {
        for (name, output) in &template.outputs {
            let context = format!("Outputs.{name}");
            if let Some(guard) = &output.condition
                && conditions.get(guard).is_none()
            {
                return Err(ValidationError::UnknownIdentifier {
                    context: format!("{context}.Condition"),
                    name: guard.clone(),
                });
            }
            for reference in output.value.references() {
                let known = match &reference {
                    Reference::Condition(c) => conditions.get(c).is_some(),
                    Reference::Name(n) => {
                        template.resources.contains_key(n)
                            || template.parameters.contains_key(n)
                            || pseudo.is_pseudo(n)
                    }
                    Reference::Attribute { resource, .. } => template.resources.contains_key(resource),
                };
                if !known {
                    return Err(match reference {
                        Reference::Condition(c) => ValidationError::UnknownIdentifier { context, name: c },
                        Reference::Name(n) => ValidationError::UnresolvedReference { context, reference: n },
                        Reference::Attribute { resource, attribute } => ValidationError::UnresolvedReference {
                            context,
                            reference: format!("{resource}.{attribute}"),
                        },
                    });
                }
            }
        }
        Ok(())
    }
}

/// Step ids allocated to one resource.
#[derive(Debug, Default, Clone, Copy)]
struct ResourceSteps {
    /// Step after which the resource's new instance is usable.
    ready: Option<usize>,
    /// Step that removes the resource's old instance.
    removal: Option<usize>,
    /// In-place update step.
    update: Option<usize>,
}

/// Lays out the execution DAG.
///
/// Forward steps (create, update, create-replacement) follow the new graph.
/// Deletes follow the prior graph in reverse: a resource is removed only
/// after everything that used to depend on it was removed or rewired.
fn build_steps(
    actions: &[PlannedAction],
    graph: &DependencyGraph,
    prior_graph: &DependencyGraph,
    prior: &StateSnapshot,
) -> Vec<ExecutionStep> {
    let mut steps: Vec<ExecutionStep> = Vec::new();
    let mut by_name: HashMap<&str, ResourceSteps> = HashMap::new();
    let alloc = |steps: &mut Vec<ExecutionStep>, action: &PlannedAction, resource_type: &str, operation| {
        let id = steps.len();
        steps.push(ExecutionStep {
            id,
            logical_name: action.logical_name.clone(),
            resource_type: resource_type.to_string(),
            operation,
            depends_on: Vec::new(),
        });
        id
    };

    for action in actions {
        let entry = by_name.entry(action.logical_name.as_str()).or_default();
        match action.kind {
            ActionKind::Create => {
                entry.ready = Some(alloc(&mut steps, action, &action.resource_type, StepOperation::Create));
            }
            ActionKind::Update => {
                let id = alloc(&mut steps, action, &action.resource_type, StepOperation::Update);
                entry.ready = Some(id);
                entry.update = Some(id);
            }
            ActionKind::Replace => {
                let old_type = prior
                    .get(&action.logical_name)
                    .map_or(action.resource_type.as_str(), |r| r.resource_type.as_str());
                if action.strategy == Some(ReplacementStrategy::DeleteBeforeCreate) {
                    entry.removal = Some(alloc(&mut steps, action, old_type, StepOperation::DeleteReplaced));
                }
                entry.ready = Some(alloc(&mut steps, action, &action.resource_type, StepOperation::CreateReplacement));
            }
            ActionKind::Delete | ActionKind::NoOp => {}
        }
    }

    // Old instances replaced create-before-delete go once dependents are rewired.
    for action in actions.iter().rev() {
        if action.kind == ActionKind::Replace && action.strategy != Some(ReplacementStrategy::DeleteBeforeCreate) {
            let old_type = prior
                .get(&action.logical_name)
                .map_or(action.resource_type.as_str(), |r| r.resource_type.as_str());
            let id = alloc(&mut steps, action, old_type, StepOperation::DeleteReplaced);
            by_name.entry(action.logical_name.as_str()).or_default().removal = Some(id);
        }
    }

    for action in actions {
        if action.kind == ActionKind::Delete {
            let retain = prior
                .get(&action.logical_name)
                .is_some_and(|r| r.deletion_policy == DeletionPolicy::Retain);
            let id = alloc(&mut steps, action, &action.resource_type, StepOperation::Delete { retain });
            by_name.entry(action.logical_name.as_str()).or_default().removal = Some(id);
        }
    }

    let ready_of = |name: &str| by_name.get(name).and_then(|s| s.ready);
    let prior_dependents = |name: &str| -> Vec<String> { prior_graph.dependents_of(name) };

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for step in &steps {
        let name = step.logical_name.as_str();
        let deps = &mut edges[step.id];
        match step.operation {
            StepOperation::Create | StepOperation::Update => {
                deps.extend(graph.dependencies_of(name).iter().filter_map(|d| ready_of(d.as_str())));
            }
            StepOperation::CreateReplacement => {
                deps.extend(graph.dependencies_of(name).iter().filter_map(|d| ready_of(d.as_str())));
                if let Some(removal) = by_name.get(name).and_then(|s| s.removal)
                    && removal < step.id
                {
                    deps.push(removal);
                }
            }
            StepOperation::DeleteReplaced => {
                let Some(ready) = ready_of(name) else {
                    continue;
                };
                if ready < step.id {
                    // Create-before-delete: new instance first, then every
                    // dependent rewired, then whatever still pointed here.
                    deps.push(ready);
                    deps.extend(graph.dependents_of(name).iter().filter_map(|d| ready_of(d.as_str())));
                    deps.extend(prior_dependents(name).iter().filter_map(|d| by_name.get(d.as_str())?.removal));
                }
            }
            StepOperation::Delete { .. } => {
                for dependent in prior_dependents(name) {
                    if let Some(s) = by_name.get(dependent.as_str()) {
                        deps.extend(s.removal);
                        deps.extend(s.update);
                    }
                }
            }
        }
        deps.retain(|&d| d != step.id);
        deps.sort_unstable();
        deps.dedup();
    }

    // Delete-before-create removals also wait for old dependents to go,
    // unless that removal itself waits on this resource.
    for step in &steps {
        let name = step.logical_name.as_str();
        if step.operation != StepOperation::DeleteReplaced || ready_of(name).is_some_and(|ready| ready < step.id) {
            continue;
        }
        for dependent in prior_dependents(name) {
            if let Some(removal) = by_name.get(dependent.as_str()).and_then(|s| s.removal)
                && !depends_transitively(&edges, removal, step.id)
            {
                edges[step.id].push(removal);
            }
        }
        edges[step.id].sort_unstable();
        edges[step.id].dedup();
    }

    for (step, deps) in steps.iter_mut().zip(edges) {
        step.depends_on = deps;
    }
    steps
}

/// True if step `from` waits, directly or not, on step `to`.
fn depends_transitively(edges: &[Vec<usize>], from: usize, to: usize) -> bool {
    let mut seen = vec![false; edges.len()];
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        if id == to {
            return true;
        }
        if !std::mem::replace(&mut seen[id], true) {
            stack.extend(&edges[id]);
        }
    }
    false
}
