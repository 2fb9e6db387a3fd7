//! Intrinsic function resolution.

use indexmap::IndexMap;
use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::template::{Expr, Properties, Reference, SubPart, Value, sub_reference};

use super::{NO_VALUE, ResolveContext, ResourceBinding};

/// Resolves expressions against a [`ResolveContext`].
///
/// `Ok(None)` means the value was omitted with `AWS::NoValue`. Omission is
/// settled at the nearest enclosing property, list item or map entry.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    ctx: ResolveContext<'a>,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver over a context.
    #[must_use]
    pub const fn new(ctx: ResolveContext<'a>) -> Self {
        Self { ctx }
    }

    /// Resolves a property mapping, dropping omitted properties.
    ///
    /// # Errors
    ///
    /// Returns the first reference or expression error encountered.
    pub fn resolve_properties(
        &self,
        context: &str,
        properties: &IndexMap<String, Expr>,
    ) -> Result<Properties, ValidationError> {
        let mut out = Properties::new();
        for (name, expr) in properties {
            let at = format!("{context}.{name}");
            if let Some(value) = self.resolve(expr, &at)? {
                out.insert(name.clone(), value);
            }
        }
        Ok(out)
    }

    /// Resolves a single expression.
    ///
    /// # Errors
    ///
    /// Returns an error if a reference cannot be resolved or an intrinsic is
    /// applied to values of the wrong shape.
    pub fn resolve(&self, expr: &Expr, context: &str) -> Result<Option<Value>, ValidationError> {
        match expr {
            Expr::Null => Ok(Some(Value::Null)),
            Expr::Bool(b) => Ok(Some(Value::Bool(*b))),
            Expr::Number(n) => Ok(Some(Value::Number(n.clone()))),
            Expr::String(s) => Ok(Some(Value::String(s.clone()))),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(value) = self.resolve(item, context)? {
                        out.push(value);
                    }
                }
                Ok(Some(Value::List(out)))
            }
            Expr::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    if let Some(value) = self.resolve(item, &format!("{context}.{key}"))? {
                        out.insert(key.clone(), value);
                    }
                }
                Ok(Some(Value::Map(out)))
            }
            Expr::Ref(name) => self.reference(name, context),
            Expr::GetAtt { resource, attribute } => self.attribute(resource, attribute, context).map(Some),
            Expr::Sub { parts, variables } => self.substitute(parts, variables, context).map(Some),
            Expr::If { condition, then, otherwise } => {
                if self.condition(condition, context)? {
                    self.resolve(then, context)
                } else {
                    self.resolve(otherwise, context)
                }
            }
            Expr::Equals(a, b) => {
                let a = self.required(a, context, "Fn::Equals")?;
                let b = self.required(b, context, "Fn::Equals")?;
                if let Some(unknown) = first_unknown(&[&a, &b]) {
                    return Ok(Some(unknown));
                }
                Ok(Some(Value::Bool(a.loosely_equals(&b))))
            }
            Expr::And(_) | Expr::Or(_) | Expr::Not(_) | Expr::Condition(_) => {
                self.boolean(expr, context).map(|b| Some(Value::Bool(b)))
            }
            Expr::Join { delimiter, items } => {
                let items = match self.required(items, context, "Fn::Join")? {
                    Value::List(items) => items,
                    other => return unknown_or(other, context, "Fn::Join expects a list"),
                };
                if let Some(unknown) = first_unknown(&items.iter().collect::<Vec<_>>()) {
                    return Ok(Some(unknown));
                }
                let parts = items
                    .iter()
                    .map(|item| {
                        item.scalar_string().ok_or_else(|| {
                            ValidationError::expression(context, "Fn::Join items must be scalars")
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(Value::String(parts.join(delimiter))))
            }
            Expr::Select { index, list } => {
                let index = self.required(index, context, "Fn::Select")?;
                let list = self.required(list, context, "Fn::Select")?;
                if let Some(unknown) = first_unknown(&[&index]) {
                    return Ok(Some(unknown));
                }
                let position = index
                    .scalar_string()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| ValidationError::expression(context, "Fn::Select index must be a non-negative integer"))?;
                let items = match list {
                    Value::List(items) => items,
                    other => return unknown_or(other, context, "Fn::Select expects a list"),
                };
                items.into_iter().nth(position).map(Some).ok_or_else(|| {
                    ValidationError::expression(context, format!("Fn::Select index {position} out of range"))
                })
            }
            Expr::Split { delimiter, source } => {
                let s = match self.required(source, context, "Fn::Split")? {
                    Value::String(s) => s,
                    other => return unknown_or(other, context, "Fn::Split expects a string"),
                };
                Ok(Some(Value::List(s.split(delimiter.as_str()).map(Value::string).collect())))
            }
        }
    }

    /// Evaluates a boolean expression (`Fn::And`, `Fn::Or`, `Fn::Not`,
    /// `Condition`, `Fn::Equals` or a boolean literal).
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is not boolean or refers to an
    /// unknown condition.
    pub fn boolean(&self, expr: &Expr, context: &str) -> Result<bool, ValidationError> {
        match expr {
            Expr::Bool(b) => Ok(*b),
            Expr::Condition(name) => self.condition(name, context),
            Expr::Not(inner) => Ok(!self.boolean(inner, context)?),
            Expr::And(items) => {
                for item in items {
                    if !self.boolean(item, context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(items) => {
                for item in items {
                    if self.boolean(item, context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::If { condition, then, otherwise } => {
                if self.condition(condition, context)? {
                    self.boolean(then, context)
                } else {
                    self.boolean(otherwise, context)
                }
            }
            other => match self.required(other, context, "condition")? {
                Value::Bool(b) => Ok(b),
                Value::String(s) if s == "true" => Ok(true),
                Value::String(s) if s == "false" => Ok(false),
                value => Err(ValidationError::expression(
                    context,
                    format!("expected a boolean, got {}", value.type_name()),
                )),
            },
        }
    }

    fn condition(&self, name: &str, context: &str) -> Result<bool, ValidationError> {
        self.ctx
            .conditions
            .get(name)
            .ok_or_else(|| ValidationError::UnknownIdentifier {
                context: context.to_string(),
                name: name.to_string(),
            })
    }

    /// Resolves an operand that may not be omitted.
    fn required(&self, expr: &Expr, context: &str, function: &str) -> Result<Value, ValidationError> {
        self.resolve(expr, context)?.ok_or_else(|| {
            ValidationError::expression(context, format!("{NO_VALUE} is not allowed inside {function}"))
        })
    }

    fn reference(&self, name: &str, context: &str) -> Result<Option<Value>, ValidationError> {
        if name == NO_VALUE {
            return Ok(None);
        }
        if let Some(value) = self.ctx.pseudo.get(name) {
            return Ok(Some(Value::string(value)));
        }
        if let Some(value) = self.ctx.parameters.get(name) {
            return Ok(Some(value.clone()));
        }

        match self.ctx.resources.binding(name) {
            ResourceBinding::Undeclared => Err(ValidationError::UnresolvedReference {
                context: context.to_string(),
                reference: name.to_string(),
            }),
            ResourceBinding::Inactive => Err(ValidationError::DanglingReference {
                context: context.to_string(),
                target: name.to_string(),
            }),
            ResourceBinding::Pending => Ok(Some(Value::Unknown(name.to_string()))),
            ResourceBinding::Known { physical_id, .. } | ResourceBinding::Updating { physical_id } => {
                Ok(Some(Value::string(physical_id)))
            }
        }
    }

    fn attribute(&self, resource: &str, attribute: &str, context: &str) -> Result<Value, ValidationError> {
        let reference = format!("{resource}.{attribute}");
        match self.ctx.resources.binding(resource) {
            ResourceBinding::Undeclared => Err(ValidationError::UnresolvedReference {
                context: context.to_string(),
                reference,
            }),
            ResourceBinding::Inactive => Err(ValidationError::DanglingReference {
                context: context.to_string(),
                target: resource.to_string(),
            }),
            ResourceBinding::Pending | ResourceBinding::Updating { .. } => Ok(Value::Unknown(reference)),
            ResourceBinding::Known { attributes, .. } => lookup_attribute(attributes, attribute)
                .cloned()
                .ok_or(ValidationError::UnresolvedReference {
                    context: context.to_string(),
                    reference,
                }),
        }
    }

    fn substitute(
        &self,
        parts: &[SubPart],
        variables: &IndexMap<String, Expr>,
        context: &str,
    ) -> Result<Value, ValidationError> {
        let mut out = String::new();
        for part in parts {
            let name = match part {
                SubPart::Text(text) => {
                    out.push_str(text);
                    continue;
                }
                SubPart::Name(name) => name,
            };

            let value = if let Some(variable) = variables.get(name) {
                self.resolve(variable, context)?
            } else {
                match sub_reference(name) {
                    Reference::Attribute { resource, attribute } => {
                        Some(self.attribute(&resource, &attribute, context)?)
                    }
                    _ => self.reference(name, context)?,
                }
            };

            let value = value.ok_or_else(|| {
                ValidationError::expression(context, format!("{NO_VALUE} is not allowed inside Fn::Sub"))
            })?;
            if let Value::Unknown(_) = value {
                return Ok(value);
            }
            let rendered = value.scalar_string().ok_or_else(|| {
                ValidationError::expression(
                    context,
                    format!("${{{name}}} resolves to a {}, expected a scalar", value.type_name()),
                )
            })?;
            out.push_str(&rendered);
        }
        Ok(Value::String(out))
    }
}

/// Attributes may be nested, e.g. `Endpoint.Address`.
fn lookup_attribute<'v>(attributes: &'v Properties, attribute: &str) -> Option<&'v Value> {
    if let Some(value) = attributes.get(attribute) {
        return Some(value);
    }
    let mut segments = attribute.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        match current {
            Value::Map(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

fn first_unknown(values: &[&Value]) -> Option<Value> {
    values.iter().find_map(|value| match value {
        Value::Unknown(source) => Some(Value::Unknown(source.clone())),
        Value::List(items) => first_unknown(&items.iter().collect::<Vec<_>>()),
        Value::Map(map) => first_unknown(&map.values().collect::<Vec<_>>()),
        _ => None,
    })
}

fn unknown_or(value: Value, context: &str, message: &str) -> Result<Option<Value>, ValidationError> {
    match value {
        Value::Unknown(_) => Ok(Some(value)),
        _ => Err(ValidationError::expression(context, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{
        ConditionValues, NoResources, ParameterResolver, PseudoParameters, ResolvedParameters,
        ResourceLookup,
    };
    use crate::template::{ParameterDecl, ParameterType};

    struct Lookup {
        known: Properties,
    }

    impl ResourceLookup for Lookup {
        fn binding(&self, name: &str) -> ResourceBinding<'_> {
            match name {
                "Lb" => ResourceBinding::Known {
                    physical_id: "lb-123",
                    attributes: &self.known,
                },
                "Pending" => ResourceBinding::Pending,
                "Updating" => ResourceBinding::Updating { physical_id: "tg-7" },
                "Guarded" => ResourceBinding::Inactive,
                _ => ResourceBinding::Undeclared,
            }
        }
    }

    fn parse(yaml: &str) -> Expr {
        let node: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        Expr::parse(&node, "test").unwrap()
    }

    fn parameters() -> ResolvedParameters {
        let decls = [
            ParameterDecl::new("Port", ParameterType::Number).with_default("80"),
            ParameterDecl::new("Env", ParameterType::String).with_default("prod"),
            ParameterDecl::new("Zones", ParameterType::CommaDelimitedList).with_default("a,b,c"),
        ]
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect();
        ParameterResolver::new().resolve(&decls, &BTreeMap::new()).unwrap()
    }

    fn resolve_with(yaml: &str, conditions: &ConditionValues) -> Result<Option<Value>, ValidationError> {
        let params = parameters();
        let pseudo = PseudoParameters::default();
        let mut known = Properties::new();
        known.insert(String::from("DNSName"), Value::string("lb.example.com"));
        let lookup = Lookup { known };
        let ctx = ResolveContext {
            parameters: &params,
            conditions,
            pseudo: &pseudo,
            resources: &lookup,
        };
        Resolver::new(ctx).resolve(&parse(yaml), "Resources.Test")
    }

    fn resolve(yaml: &str) -> Result<Option<Value>, ValidationError> {
        resolve_with(yaml, &ConditionValues::default())
    }

    #[test]
    fn test_ref_parameter_and_pseudo() {
        assert_eq!(resolve("!Ref Port").unwrap(), Some(Value::integer(80)));
        assert_eq!(resolve("!Ref AWS::Region").unwrap(), Some(Value::string("us-east-1")));
        assert_eq!(resolve("!Ref Lb").unwrap(), Some(Value::string("lb-123")));
    }

    #[test]
    fn test_sub_interpolates_everything() {
        let value = resolve("!Sub '${AWS::StackName}-${Env}-${Lb.DNSName}:${Port}'").unwrap();
        assert_eq!(value, Some(Value::string("strata-prod-lb.example.com:80")));
    }

    #[test]
    fn test_pending_resource_yields_unknown() {
        assert_eq!(
            resolve("!GetAtt Pending.Arn").unwrap(),
            Some(Value::Unknown(String::from("Pending.Arn")))
        );
        assert_eq!(
            resolve("!Sub 'arn-${Pending.Arn}'").unwrap(),
            Some(Value::Unknown(String::from("Pending.Arn")))
        );
        assert_eq!(
            resolve("!Join [',', [a, !Ref Pending]]").unwrap(),
            Some(Value::Unknown(String::from("Pending")))
        );
    }

    #[test]
    fn test_updating_resource_keeps_id_but_not_attributes() {
        assert_eq!(resolve("!Ref Updating").unwrap(), Some(Value::string("tg-7")));
        assert_eq!(
            resolve("!GetAtt Updating.Port").unwrap(),
            Some(Value::Unknown(String::from("Updating.Port")))
        );
    }

    #[test]
    fn test_reference_errors() {
        assert!(matches!(
            resolve("!Ref Missing").unwrap_err(),
            ValidationError::UnresolvedReference { .. }
        ));
        assert!(matches!(
            resolve("!GetAtt Guarded.Arn").unwrap_err(),
            ValidationError::DanglingReference { target, .. } if target == "Guarded"
        ));
        assert!(matches!(
            resolve("!GetAtt Lb.Missing").unwrap_err(),
            ValidationError::UnresolvedReference { .. }
        ));
    }

    #[test]
    fn test_if_only_resolves_taken_branch() {
        let mut conditions = ConditionValues::default();
        conditions.insert("Enabled", false);

        let value = resolve_with("!If [Enabled, !GetAtt Guarded.Arn, fallback]", &conditions).unwrap();
        assert_eq!(value, Some(Value::string("fallback")));

        assert!(matches!(
            resolve("!If [Undefined, a, b]").unwrap_err(),
            ValidationError::UnknownIdentifier { .. }
        ));
    }

    #[test]
    fn test_no_value_omits_at_nearest_container() {
        let mut conditions = ConditionValues::default();
        conditions.insert("Enabled", false);

        let value = resolve_with(
            "{ Name: web, Logs: !If [Enabled, on, !Ref AWS::NoValue], Items: [a, !Ref AWS::NoValue] }",
            &conditions,
        )
        .unwrap()
        .unwrap();
        let Value::Map(map) = value else {
            panic!("expected a map");
        };
        assert!(!map.contains_key("Logs"));
        assert_eq!(map["Items"], Value::List(vec![Value::string("a")]));

        assert!(resolve("!Sub ['${X}', { X: !Ref AWS::NoValue }]").is_err());
    }

    #[test]
    fn test_join_select_split() {
        assert_eq!(resolve("!Join ['-', [a, !Ref Env]]").unwrap(), Some(Value::string("a-prod")));
        assert_eq!(resolve("!Select [1, !Ref Zones]").unwrap(), Some(Value::string("b")));
        assert_eq!(
            resolve("!Split [',', 'x,y']").unwrap(),
            Some(Value::List(vec![Value::string("x"), Value::string("y")]))
        );
        assert!(resolve("!Select [5, !Ref Zones]").is_err());
    }

    #[test]
    fn test_equals_is_loose() {
        assert_eq!(resolve("!Equals [!Ref Port, '80']").unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_resources_not_visible_without_lookup() {
        let params = parameters();
        let pseudo = PseudoParameters::default();
        let conditions = ConditionValues::default();
        let ctx = ResolveContext {
            parameters: &params,
            conditions: &conditions,
            pseudo: &pseudo,
            resources: &NoResources,
        };
        assert!(Resolver::new(ctx).resolve(&parse("!Ref Lb"), "x").is_err());
    }
}
