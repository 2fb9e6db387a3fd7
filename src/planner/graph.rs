//! Resource dependency graph.
//!
//! Edges come from every reference a resource's properties make (in all
//! `Fn::If` branches, taken or not) and from explicit `DependsOn`. Only
//! resources whose guard condition holds take part. Cycles are reported with
//! exactly the strongly connected participants; the topological order breaks
//! ties by declaration order.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

use crate::error::ValidationError;
use crate::resolver::{ConditionValues, PseudoParameters};
use crate::state::StateSnapshot;
use crate::template::{Reference, Template};

/// Dependency graph over active resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Resources in dependency order.
    order: Vec<String>,
    /// Resource -> resources it depends on.
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph for a template under evaluated conditions.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIdentifier` for guards or `Fn::If` conditions that are
    /// not defined, `UnresolvedReference` for names that match nothing,
    /// `DanglingReference` for `DependsOn` on a guarded-out resource and
    /// `CyclicDependency` if active resources depend on each other in a loop.
    pub fn build(
        template: &Template,
        conditions: &ConditionValues,
        pseudo: &PseudoParameters,
    ) -> Result<Self, ValidationError> {
        let mut active = Vec::new();
        for (name, resource) in &template.resources {
            let enabled = match &resource.condition {
                Some(guard) => conditions.get(guard).ok_or_else(|| ValidationError::UnknownIdentifier {
                    context: format!("Resources.{name}.Condition"),
                    name: guard.clone(),
                })?,
                None => true,
            };
            if enabled {
                active.push(name.as_str());
            } else {
                debug!("Resource {} excluded by condition", name);
            }
        }
        let is_active = |name: &str| active.contains(&name);

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for &name in &active {
            let resource = &template.resources[name];
            let mut deps = BTreeSet::new();

            for (property, expr) in &resource.properties {
                let context = format!("Resources.{name}.Properties.{property}");
                for reference in expr.references() {
                    if let Some(target) = check_reference(template, conditions, pseudo, &reference, &context)?
                        && is_active(target)
                    {
                        deps.insert(target.to_string());
                    }
                }
            }

            for target in &resource.depends_on {
                let context = format!("Resources.{name}.DependsOn");
                if !template.resources.contains_key(target) {
                    return Err(ValidationError::UnresolvedReference {
                        context,
                        reference: target.clone(),
                    });
                }
                if !is_active(target) {
                    return Err(ValidationError::DanglingReference {
                        context,
                        target: target.clone(),
                    });
                }
                deps.insert(target.clone());
            }

            dependencies.insert(name.to_string(), deps);
        }

        let nodes: Vec<(String, usize)> = active
            .iter()
            .map(|name| ((*name).to_string(), template.resource_index(name).unwrap_or(usize::MAX)))
            .collect();

        if let Some(cycle) = find_cycle(&nodes, &dependencies) {
            return Err(ValidationError::CyclicDependency { resources: cycle });
        }

        let order = topological_order(&nodes, &dependencies);
        debug!("Dependency order: {}", order.join(", "));
        Ok(Self { order, dependencies })
    }

    /// Rebuilds the graph recorded in a state snapshot.
    #[must_use]
    pub fn from_state(snapshot: &StateSnapshot) -> Self {
        let nodes: Vec<(String, usize)> = snapshot
            .resources
            .values()
            .map(|r| (r.logical_name.clone(), r.index))
            .collect();
        let dependencies = snapshot
            .resources
            .values()
            .map(|r| {
                let deps = r
                    .dependencies
                    .iter()
                    .filter(|d| snapshot.resources.contains_key(*d))
                    .cloned()
                    .collect();
                (r.logical_name.clone(), deps)
            })
            .collect();

        let order = topological_order(&nodes, &dependencies);
        Self { order, dependencies }
    }

    /// Resources in dependency order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Returns true if the resource is part of the graph.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    /// Resources `name` depends on.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.dependencies
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resources that depend on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Position of a resource in the dependency order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }
}

/// Validates a reference statically and returns the resource it targets, if
/// any.
fn check_reference<'r>(
    template: &Template,
    conditions: &ConditionValues,
    pseudo: &PseudoParameters,
    reference: &'r Reference,
    context: &str,
) -> Result<Option<&'r str>, ValidationError> {
    match reference {
        Reference::Condition(name) => {
            if conditions.get(name).is_none() {
                return Err(ValidationError::UnknownIdentifier {
                    context: context.to_string(),
                    name: name.clone(),
                });
            }
            Ok(None)
        }
        Reference::Name(name) => {
            if template.resources.contains_key(name) {
                Ok(Some(name))
            } else if template.parameters.contains_key(name) || pseudo.is_pseudo(name) {
                Ok(None)
            } else {
                Err(ValidationError::UnresolvedReference {
                    context: context.to_string(),
                    reference: name.clone(),
                })
            }
        }
        Reference::Attribute { resource, attribute } => {
            if template.resources.contains_key(resource) {
                Ok(Some(resource))
            } else {
                Err(ValidationError::UnresolvedReference {
                    context: context.to_string(),
                    reference: format!("{resource}.{attribute}"),
                })
            }
        }
    }
}

/// Finds the strongly connected component that forms a cycle, preferring
/// the one containing the earliest-declared resource.
fn find_cycle(
    nodes: &[(String, usize)],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Option<Vec<String>> {
    let mut graph = DiGraph::<usize, ()>::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for (i, (name, _)) in nodes.iter().enumerate() {
        indices.insert(name.as_str(), graph.add_node(i));
    }

    for (name, deps) in dependencies {
        let Some(&to) = indices.get(name.as_str()) else {
            continue;
        };
        for dep in deps {
            if let Some(&from) = indices.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || component.iter().any(|&n| graph.contains_edge(n, n))
        })
        .map(|component| {
            let mut members: Vec<&(String, usize)> = component.iter().map(|&n| &nodes[graph[n]]).collect();
            members.sort_by_key(|(_, index)| *index);
            members.into_iter().map(|(name, _)| name.clone()).collect::<Vec<_>>()
        })
        .min_by_key(|members: &Vec<String>| {
            members
                .first()
                .and_then(|first| nodes.iter().find(|(n, _)| n == first))
                .map_or(usize::MAX, |(_, index)| *index)
        })
}

/// Kahn's algorithm, always releasing the lowest declaration index first.
/// Nodes left over by a cycle are appended in declaration order.
fn topological_order(
    nodes: &[(String, usize)],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut sorted: Vec<&(String, usize)> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let rank: HashMap<&str, usize> = sorted.iter().enumerate().map(|(i, (name, _))| (name.as_str(), i)).collect();

    let mut remaining: Vec<usize> = sorted
        .iter()
        .map(|(name, _)| {
            dependencies
                .get(name)
                .map_or(0, |deps| deps.iter().filter(|d| rank.contains_key(d.as_str())).count())
        })
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(sorted.len());
    let mut placed = vec![false; sorted.len()];
    while let Some(Reverse(i)) = ready.pop() {
        let name = &sorted[i].0;
        order.push(name.clone());
        placed[i] = true;

        for (dependent, deps) in dependencies {
            if deps.contains(name)
                && let Some(&j) = rank.get(dependent.as_str())
            {
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }
    }

    order.extend(
        sorted
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, (name, _))| name.clone()),
    );
    order
}
