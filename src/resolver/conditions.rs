//! Condition evaluation.

use indexmap::IndexMap;
use tracing::debug;

use crate::error::ValidationError;
use crate::template::{Expr, Reference, Template};

use super::{NoResources, PseudoParameters, ResolveContext, ResolvedParameters, Resolver};

/// Evaluated conditions, immutable for the lifetime of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionValues {
    values: IndexMap<String, bool>,
}

impl ConditionValues {
    /// Gets the value of a condition.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.values.get(name).copied()
    }

    /// Records a condition value.
    pub fn insert(&mut self, name: impl Into<String>, value: bool) {
        self.values.insert(name.into(), value);
    }

    /// Iterates over conditions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Evaluates a template's conditions in declaration order.
#[derive(Debug, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Creates a new condition evaluator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Evaluates every condition. A condition may only refer to parameters,
    /// pseudo-parameters and conditions declared before it.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIdentifier` for references to undefined or
    /// not-yet-defined names, and `InvalidExpression` for non-boolean
    /// conditions.
    pub fn evaluate(
        &self,
        template: &Template,
        parameters: &ResolvedParameters,
        pseudo: &PseudoParameters,
    ) -> Result<ConditionValues, ValidationError> {
        let mut values = ConditionValues::default();

        for (name, expr) in &template.conditions {
            let context = format!("Conditions.{name}");
            Self::check_references(expr, &context, &values, parameters, pseudo)?;

            let ctx = ResolveContext {
                parameters,
                conditions: &values,
                pseudo,
                resources: &NoResources,
            };
            let result = Resolver::new(ctx).boolean(expr, &context)?;
            debug!("Condition {} = {}", name, result);
            values.insert(name.clone(), result);
        }

        Ok(values)
    }

    fn check_references(
        expr: &Expr,
        context: &str,
        known: &ConditionValues,
        parameters: &ResolvedParameters,
        pseudo: &PseudoParameters,
    ) -> Result<(), ValidationError> {
        for reference in expr.references() {
            let defined = match &reference {
                Reference::Condition(name) => known.get(name).is_some(),
                Reference::Name(name) => parameters.get(name).is_some() || pseudo.is_pseudo(name),
                Reference::Attribute { .. } => false,
            };
            if !defined {
                let name = match reference {
                    Reference::Attribute { resource, attribute } => format!("{resource}.{attribute}"),
                    Reference::Name(name) | Reference::Condition(name) => name,
                };
                return Err(ValidationError::UnknownIdentifier {
                    context: context.to_string(),
                    name,
                });
            }
        }
        Ok(())
    }
}
