//! Parameter resolution.

use indexmap::IndexMap;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ValidationError;
use crate::template::{ParameterDecl, ParameterType, Value};

use super::ResolvedParameters;

/// Resolves parameter declarations against caller overrides.
#[derive(Debug, Default)]
pub struct ParameterResolver;

impl ParameterResolver {
    /// Creates a new parameter resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Produces a typed value for every declared parameter.
    ///
    /// Overrides win over defaults. Both are checked against the declared
    /// type and constraints.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIdentifier` for overrides of undeclared parameters,
    /// `MissingRequiredParameter` when neither override nor default exists,
    /// `TypeMismatch` when a value cannot be coerced and
    /// `InvalidParameterValue` when a constraint is violated.
    pub fn resolve(
        &self,
        declarations: &IndexMap<String, ParameterDecl>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ResolvedParameters, ValidationError> {
        if let Some(name) = overrides.keys().find(|name| !declarations.contains_key(*name)) {
            return Err(ValidationError::UnknownIdentifier {
                context: String::from("parameter overrides"),
                name: name.clone(),
            });
        }

        let mut resolved = ResolvedParameters::default();
        for (name, decl) in declarations {
            let raw = overrides
                .get(name)
                .or(decl.default.as_ref())
                .ok_or_else(|| ValidationError::MissingRequiredParameter { name: name.clone() })?;

            let value = Self::coerce(decl, raw)?;
            debug!(
                "Parameter {} = {}",
                name,
                if decl.no_echo { "****" } else { raw.as_str() }
            );
            resolved.insert(name.clone(), value, decl.no_echo);
        }

        Ok(resolved)
    }

    fn coerce(decl: &ParameterDecl, raw: &str) -> Result<Value, ValidationError> {
        match &decl.param_type {
            ParameterType::String => {
                check_string(decl, raw)?;
                Ok(Value::string(raw))
            }
            ParameterType::ResourceId(_) => {
                if raw.trim().is_empty() {
                    return Err(type_mismatch(decl, raw));
                }
                check_string(decl, raw)?;
                Ok(Value::string(raw))
            }
            ParameterType::Number => {
                let number = parse_number(decl, raw)?;
                check_number(decl, raw, &number)?;
                Ok(Value::Number(number))
            }
            ParameterType::CommaDelimitedList | ParameterType::ResourceIdList(_) => split(raw)
                .map(|item| {
                    check_string(decl, item)?;
                    Ok(Value::string(item))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            ParameterType::NumberList => split(raw)
                .map(|item| {
                    let number = parse_number(decl, item)?;
                    check_number(decl, item, &number)?;
                    Ok(Value::Number(number))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
        }
    }
}

fn split(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_number(decl: &ParameterDecl, raw: &str) -> Result<serde_json::Number, ValidationError> {
    let trimmed = raw.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(serde_json::Number::from(i));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .ok_or_else(|| type_mismatch(decl, raw))
}

fn type_mismatch(decl: &ParameterDecl, raw: &str) -> ValidationError {
    ValidationError::TypeMismatch {
        name: decl.name.clone(),
        expected: decl.param_type.to_string(),
        value: display_value(decl, raw),
    }
}

fn invalid(decl: &ParameterDecl, raw: &str, reason: String) -> ValidationError {
    ValidationError::InvalidParameterValue {
        name: decl.name.clone(),
        value: display_value(decl, raw),
        reason: decl.constraint_description.clone().unwrap_or(reason),
    }
}

fn display_value(decl: &ParameterDecl, raw: &str) -> String {
    if decl.no_echo {
        String::from("****")
    } else {
        raw.to_string()
    }
}

fn check_string(decl: &ParameterDecl, raw: &str) -> Result<(), ValidationError> {
    if !decl.allowed_values.is_empty() && !decl.allowed_values.iter().any(|v| v == raw) {
        return Err(invalid(
            decl,
            raw,
            format!("must be one of [{}]", decl.allowed_values.join(", ")),
        ));
    }

    if let Some(pattern) = &decl.allowed_pattern {
        let anchored = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| invalid(decl, raw, format!("invalid AllowedPattern: {e}")))?;
        if !anchored.is_match(raw) {
            return Err(invalid(decl, raw, format!("must match pattern {pattern}")));
        }
    }

    let len = raw.chars().count();
    if let Some(min) = decl.min_length
        && len < min
    {
        return Err(invalid(decl, raw, format!("must be at least {min} characters")));
    }
    if let Some(max) = decl.max_length
        && len > max
    {
        return Err(invalid(decl, raw, format!("must be at most {max} characters")));
    }

    Ok(())
}

fn check_number(
    decl: &ParameterDecl,
    raw: &str,
    number: &serde_json::Number,
) -> Result<(), ValidationError> {
    let value = number.as_f64().unwrap_or(f64::NAN);

    if !decl.allowed_values.is_empty()
        && !decl
            .allowed_values
            .iter()
            .any(|allowed| allowed.trim().parse::<f64>().is_ok_and(|a| (a - value).abs() < f64::EPSILON))
    {
        return Err(invalid(
            decl,
            raw,
            format!("must be one of [{}]", decl.allowed_values.join(", ")),
        ));
    }

    if let Some(min) = decl.min_value
        && value < min
    {
        return Err(invalid(decl, raw, format!("must be at least {min}")));
    }
    if let Some(max) = decl.max_value
        && value > max
    {
        return Err(invalid(decl, raw, format!("must be at most {max}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls(list: Vec<ParameterDecl>) -> IndexMap<String, ParameterDecl> {
        list.into_iter().map(|d| (d.name.clone(), d)).collect()
    }

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_default_used_when_no_override() {
        let mut port = ParameterDecl::new("Port", ParameterType::Number).with_default("80");
        port.allowed_values = vec![String::from("80"), String::from("443")];

        let resolved = ParameterResolver::new()
            .resolve(&decls(vec![port]), &BTreeMap::new())
            .unwrap();
        assert_eq!(resolved.get("Port"), Some(&Value::integer(80)));
    }

    #[test]
    fn test_override_wins_and_is_checked() {
        let mut port = ParameterDecl::new("Port", ParameterType::Number).with_default("80");
        port.allowed_values = vec![String::from("80"), String::from("443")];
        let declarations = decls(vec![port]);
        let resolver = ParameterResolver::new();

        let resolved = resolver.resolve(&declarations, &overrides(&[("Port", "443")])).unwrap();
        assert_eq!(resolved.get("Port"), Some(&Value::integer(443)));

        let err = resolver.resolve(&declarations, &overrides(&[("Port", "8080")])).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameterValue { .. }));

        let err = resolver.resolve(&declarations, &overrides(&[("Port", "eighty")])).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_missing_and_unknown_parameters() {
        let resolver = ParameterResolver::new();
        let declarations = decls(vec![ParameterDecl::new("VpcId", ParameterType::ResourceId(String::from("AWS::EC2::VPC::Id")))]);

        let err = resolver.resolve(&declarations, &BTreeMap::new()).unwrap_err();
        assert_eq!(err, ValidationError::MissingRequiredParameter { name: String::from("VpcId") });

        let err = resolver
            .resolve(&declarations, &overrides(&[("VpcId", "vpc-1"), ("Typo", "x")]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownIdentifier { name, .. } if name == "Typo"));
    }

    #[test]
    fn test_list_types_split_and_validate() {
        let subnets = ParameterDecl::new("Subnets", ParameterType::ResourceIdList(String::from("AWS::EC2::Subnet::Id")))
            .with_default("subnet-a, subnet-b");
        let weights = ParameterDecl::new("Weights", ParameterType::NumberList).with_default("1,2.5");

        let resolved = ParameterResolver::new()
            .resolve(&decls(vec![subnets, weights]), &BTreeMap::new())
            .unwrap();
        assert_eq!(
            resolved.get("Subnets"),
            Some(&Value::List(vec![Value::string("subnet-a"), Value::string("subnet-b")]))
        );
        let Some(Value::List(weights)) = resolved.get("Weights") else {
            panic!("expected a list");
        };
        assert_eq!(weights.len(), 2);
    }

    #[test]
    fn test_string_constraints() {
        let mut name = ParameterDecl::new("Name", ParameterType::String);
        name.allowed_pattern = Some(String::from("[a-z]+"));
        name.max_length = Some(5);
        let declarations = decls(vec![name]);
        let resolver = ParameterResolver::new();

        assert!(resolver.resolve(&declarations, &overrides(&[("Name", "web")])).is_ok());
        assert!(resolver.resolve(&declarations, &overrides(&[("Name", "web1")])).is_err());
        assert!(resolver.resolve(&declarations, &overrides(&[("Name", "website")])).is_err());
    }

    #[test]
    fn test_no_echo_masks_rejected_value() {
        let mut secret = ParameterDecl::new("Password", ParameterType::String);
        secret.no_echo = true;
        secret.min_length = Some(8);

        let err = ParameterResolver::new()
            .resolve(&decls(vec![secret]), &overrides(&[("Password", "short")]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameterValue { value, .. } if value == "****"));
    }
}
