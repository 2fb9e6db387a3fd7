//! Template declarations.
//!
//! A template is parsed once into these types. All sections keep declaration
//! order, which drives condition evaluation and topological tie-breaking.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::expr::Expr;

/// A parsed template.
#[derive(Debug, Clone, Default)]
pub struct Template {
    /// Free-form description.
    pub description: Option<String>,
    /// Parameter declarations.
    pub parameters: IndexMap<String, ParameterDecl>,
    /// Condition declarations, evaluated in this order.
    pub conditions: IndexMap<String, Expr>,
    /// Resource declarations.
    pub resources: IndexMap<String, ResourceDecl>,
    /// Output declarations.
    pub outputs: IndexMap<String, OutputDecl>,
}

impl Template {
    /// Gets a resource by logical name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.get(name)
    }

    /// Returns the declaration index of a resource.
    #[must_use]
    pub fn resource_index(&self, name: &str) -> Option<usize> {
        self.resources.get_index_of(name)
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    /// Any string.
    String,
    /// An integer or float.
    Number,
    /// Comma-separated strings.
    CommaDelimitedList,
    /// Comma-separated numbers.
    NumberList,
    /// A provider resource identifier such as `AWS::EC2::VPC::Id`.
    ResourceId(String),
    /// A list of provider resource identifiers.
    ResourceIdList(String),
}

impl ParameterType {
    /// Parses a declared type name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "String" => Some(Self::String),
            "Number" => Some(Self::Number),
            "CommaDelimitedList" => Some(Self::CommaDelimitedList),
            "List<Number>" => Some(Self::NumberList),
            other => {
                if let Some(inner) = other.strip_prefix("List<").and_then(|s| s.strip_suffix('>')) {
                    inner
                        .contains("::")
                        .then(|| Self::ResourceIdList(inner.to_string()))
                } else {
                    other.contains("::").then(|| Self::ResourceId(other.to_string()))
                }
            }
        }
    }

    /// Returns true if values of this type are lists.
    #[must_use]
    pub const fn is_list(&self) -> bool {
        matches!(
            self,
            Self::CommaDelimitedList | Self::NumberList | Self::ResourceIdList(_)
        )
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "String"),
            Self::Number => write!(f, "Number"),
            Self::CommaDelimitedList => write!(f, "CommaDelimitedList"),
            Self::NumberList => write!(f, "List<Number>"),
            Self::ResourceId(kind) => write!(f, "{kind}"),
            Self::ResourceIdList(kind) => write!(f, "List<{kind}>"),
        }
    }
}

/// A parameter declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDecl {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub param_type: ParameterType,
    /// Default value in its raw string form.
    pub default: Option<String>,
    /// Allowed values; empty means unrestricted.
    pub allowed_values: Vec<String>,
    /// Regular expression each value must match in full.
    pub allowed_pattern: Option<String>,
    /// Minimum string length.
    pub min_length: Option<usize>,
    /// Maximum string length.
    pub max_length: Option<usize>,
    /// Minimum numeric value.
    pub min_value: Option<f64>,
    /// Maximum numeric value.
    pub max_value: Option<f64>,
    /// Masks the value in rendered plans and outputs.
    pub no_echo: bool,
    /// Free-form description.
    pub description: Option<String>,
    /// Message shown when a constraint is violated.
    pub constraint_description: Option<String>,
}

impl ParameterDecl {
    /// Creates a declaration with no default and no constraints.
    #[must_use]
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            default: None,
            allowed_values: Vec::new(),
            allowed_pattern: None,
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            no_echo: false,
            description: None,
            constraint_description: None,
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// What happens to the physical resource when its declaration is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete through the provider.
    #[default]
    Delete,
    /// Keep the physical resource and only forget it.
    Retain,
}

/// A resource declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    /// Logical name.
    pub name: String,
    /// Opaque provider type, e.g. `AWS::ElasticLoadBalancingV2::TargetGroup`.
    pub resource_type: String,
    /// Unresolved properties.
    pub properties: IndexMap<String, Expr>,
    /// Guard condition name.
    pub condition: Option<String>,
    /// Explicit dependencies.
    pub depends_on: Vec<String>,
    /// Deletion policy.
    pub deletion_policy: DeletionPolicy,
}

impl ResourceDecl {
    /// Creates a resource declaration with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            properties: IndexMap::new(),
            condition: None,
            depends_on: Vec::new(),
            deletion_policy: DeletionPolicy::Delete,
        }
    }
}

/// An output declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDecl {
    /// Output name.
    pub name: String,
    /// Value expression.
    pub value: Expr,
    /// Guard condition name.
    pub condition: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_type_parsing() {
        assert_eq!(ParameterType::parse("Number"), Some(ParameterType::Number));
        assert_eq!(ParameterType::parse("List<Number>"), Some(ParameterType::NumberList));
        assert_eq!(
            ParameterType::parse("AWS::EC2::VPC::Id"),
            Some(ParameterType::ResourceId(String::from("AWS::EC2::VPC::Id")))
        );
        assert_eq!(
            ParameterType::parse("List<AWS::EC2::Subnet::Id>"),
            Some(ParameterType::ResourceIdList(String::from("AWS::EC2::Subnet::Id")))
        );
        assert_eq!(ParameterType::parse("Integer"), None);
        assert_eq!(ParameterType::parse("List<String>"), None);
    }

    #[test]
    fn test_parameter_type_display_round_trips() {
        for raw in ["String", "CommaDelimitedList", "List<AWS::EC2::Subnet::Id>"] {
            let parsed = ParameterType::parse(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }
}
