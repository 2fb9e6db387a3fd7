//! Parameter, condition and intrinsic resolution.
//!
//! This module turns declarations into concrete values:
//! - Coercing and validating parameter overrides against their declarations
//! - Evaluating conditions in declaration order
//! - Resolving intrinsic expressions against parameters, conditions,
//!   pseudo-parameters and resource bindings
//!
//! Resolution is a pure function of its context. Resource bindings are
//! supplied through [`ResourceLookup`], so the same resolver serves plan time
//! (where pending resources yield unknown values) and execution time.

mod conditions;
mod intrinsic;
mod parameters;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::template::{Properties, Value};

pub use conditions::{ConditionEvaluator, ConditionValues};
pub use intrinsic::Resolver;
pub use parameters::ParameterResolver;

/// Sentinel that omits the enclosing property, list item or map entry.
pub const NO_VALUE: &str = "AWS::NoValue";

/// Deployment-wide values available to every template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudoParameters {
    /// Target region.
    pub region: String,
    /// Target account identifier.
    pub account_id: String,
    /// Stack name.
    pub stack_name: String,
    /// Partition, e.g. `aws`.
    pub partition: String,
}

impl Default for PseudoParameters {
    fn default() -> Self {
        Self {
            region: String::from("us-east-1"),
            account_id: String::from("123456789012"),
            stack_name: String::from("strata"),
            partition: String::from("aws"),
        }
    }
}

impl PseudoParameters {
    /// Looks up a pseudo-parameter by its `AWS::` name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "AWS::Region" => Some(&self.region),
            "AWS::AccountId" => Some(&self.account_id),
            "AWS::StackName" => Some(&self.stack_name),
            "AWS::Partition" => Some(&self.partition),
            _ => None,
        }
    }

    /// Returns true if the name is a pseudo-parameter or the omit sentinel.
    #[must_use]
    pub fn is_pseudo(&self, name: &str) -> bool {
        name == NO_VALUE || self.get(name).is_some()
    }
}

/// Resolved parameter values, immutable for the lifetime of a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParameters {
    values: IndexMap<String, Value>,
    no_echo: HashSet<String>,
}

impl ResolvedParameters {
    /// Gets a parameter value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns true if the parameter is declared `NoEcho`.
    #[must_use]
    pub fn is_secret(&self, name: &str) -> bool {
        self.no_echo.contains(name)
    }

    /// Returns the string values of every `NoEcho` parameter.
    #[must_use]
    pub fn secret_values(&self) -> Vec<String> {
        self.no_echo
            .iter()
            .filter_map(|name| self.values.get(name))
            .filter_map(Value::scalar_string)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Iterates over parameters in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, name: String, value: Value, no_echo: bool) {
        if no_echo {
            self.no_echo.insert(name.clone());
        }
        self.values.insert(name, value);
    }
}

/// How a logical resource name binds during resolution.
#[derive(Debug, Clone, Copy)]
pub enum ResourceBinding<'a> {
    /// No such resource is declared.
    Undeclared,
    /// Declared, but excluded by its guard condition.
    Inactive,
    /// Active, but its physical id and attributes are not known yet.
    Pending,
    /// Being updated in place: the physical id stands, attributes may change.
    Updating {
        /// Provider-assigned identifier.
        physical_id: &'a str,
    },
    /// Applied; id and attributes are known.
    Known {
        /// Provider-assigned identifier.
        physical_id: &'a str,
        /// Provider-reported attributes.
        attributes: &'a Properties,
    },
}

/// Source of resource bindings for the resolver.
pub trait ResourceLookup: Send + Sync {
    /// Returns the binding for a logical resource name.
    fn binding(&self, name: &str) -> ResourceBinding<'_>;
}

/// A lookup with no resources, used where resources may not be referenced.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResources;

impl ResourceLookup for NoResources {
    fn binding(&self, _name: &str) -> ResourceBinding<'_> {
        ResourceBinding::Undeclared
    }
}

/// Everything an expression may refer to.
#[derive(Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Resolved parameters.
    pub parameters: &'a ResolvedParameters,
    /// Evaluated conditions.
    pub conditions: &'a ConditionValues,
    /// Pseudo-parameters.
    pub pseudo: &'a PseudoParameters,
    /// Resource bindings.
    pub resources: &'a dyn ResourceLookup,
}

impl std::fmt::Debug for ResolveContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveContext")
            .field("parameters", &self.parameters.len())
            .field("conditions", &self.conditions)
            .field("pseudo", &self.pseudo)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudo_parameter_lookup() {
        let pseudo = PseudoParameters::default();
        assert_eq!(pseudo.get("AWS::Partition"), Some("aws"));
        assert!(pseudo.is_pseudo(NO_VALUE));
        assert!(!pseudo.is_pseudo("AWS::StackId"));
    }

    #[test]
    fn test_secret_values_only_include_no_echo() {
        let mut params = ResolvedParameters::default();
        params.insert(String::from("DbPassword"), Value::string("hunter2"), true);
        params.insert(String::from("Env"), Value::string("prod"), false);
        assert_eq!(params.secret_values(), vec![String::from("hunter2")]);
        assert!(params.is_secret("DbPassword"));
        assert!(!params.is_secret("Env"));
    }
}
