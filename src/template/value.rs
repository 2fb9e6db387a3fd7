//! Resolved property values.
//!
//! Resource types are an open set supplied by provider plugins, so property
//! mappings are modeled as a tagged tree rather than fixed structs. Maps are
//! ordered so snapshots, hashes and diffs are deterministic.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A resource's resolved property mapping.
pub type Properties = BTreeMap<String, Value>;

/// A resolved value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer or floating point number.
    Number(serde_json::Number),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
    /// Value only known once the named resource has been applied.
    Unknown(String),
}

impl Value {
    /// Creates a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Creates an integer value.
    #[must_use]
    pub fn integer(n: i64) -> Self {
        Self::Number(serde_json::Number::from(n))
    }

    /// Returns true if no `Unknown` appears anywhere in the tree.
    #[must_use]
    pub fn is_known(&self) -> bool {
        match self {
            Self::Unknown(_) => false,
            Self::List(items) => items.iter().all(Self::is_known),
            Self::Map(map) => map.values().all(Self::is_known),
            _ => true,
        }
    }

    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Renders a scalar as the string used for interpolation and equality.
    ///
    /// Returns `None` for lists, maps and unknown values.
    #[must_use]
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Self::Null => Some(String::new()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Number(n) => Some(n.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::List(_) | Self::Map(_) | Self::Unknown(_) => None,
        }
    }

    /// Compares two values the way template equality does: scalars compare by
    /// their string rendering, so `"80"` equals `80`.
    #[must_use]
    pub fn loosely_equals(&self, other: &Self) -> bool {
        match (self.scalar_string(), other.scalar_string()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Short type name used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Converts to JSON. Unknown values render as a placeholder string.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Unknown(source) => serde_json::Value::String(format!("(known after apply: {source})")),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Unknown(source) => write!(f, "(known after apply: {source})"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loose_equality_across_scalars() {
        assert!(Value::integer(80).loosely_equals(&Value::string("80")));
        assert!(Value::Bool(true).loosely_equals(&Value::string("true")));
        assert!(!Value::string("prod").loosely_equals(&Value::string("dev")));
    }

    #[test]
    fn test_unknown_is_detected_in_nested_tree() {
        let mut map = BTreeMap::new();
        map.insert(
            String::from("Targets"),
            Value::List(vec![Value::string("a"), Value::Unknown(String::from("Lb.Arn"))]),
        );
        assert!(!Value::Map(map).is_known());
        assert!(Value::List(vec![Value::integer(1)]).is_known());
    }

    #[test]
    fn test_json_serialization_is_plain() {
        let mut props = Properties::new();
        props.insert(String::from("Port"), Value::integer(80));
        props.insert(String::from("Name"), Value::string("web"));
        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"Name":"web","Port":80}"#);

        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }
}
