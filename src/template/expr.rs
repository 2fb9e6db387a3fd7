//! Intrinsic expression trees.
//!
//! Template values are parsed once into [`Expr`], which keeps literals and
//! intrinsic functions (`Ref`, `Fn::GetAtt`, `Fn::Sub`, `Fn::If`, ...) apart.
//! Both the long form (`{"Fn::GetAtt": [..]}`) and YAML short tags
//! (`!GetAtt Lb.Arn`) are accepted.

use indexmap::IndexMap;
use serde_yaml::Value as Yaml;

use crate::error::TemplateError;

/// An unresolved template value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal null.
    Null,
    /// Literal boolean.
    Bool(bool),
    /// Literal number.
    Number(serde_json::Number),
    /// Literal string.
    String(String),
    /// List whose items may contain intrinsics.
    List(Vec<Expr>),
    /// Mapping whose values may contain intrinsics.
    Map(IndexMap<String, Expr>),
    /// `Ref`: a parameter, pseudo-parameter or resource physical id.
    Ref(String),
    /// `Fn::GetAtt`: an attribute of another resource.
    GetAtt {
        /// Logical name of the resource.
        resource: String,
        /// Attribute name.
        attribute: String,
    },
    /// `Fn::Sub`: string interpolation.
    Sub {
        /// Literal text and `${Name}` placeholders, in order.
        parts: Vec<SubPart>,
        /// Local variables supplied in the two-argument form.
        variables: IndexMap<String, Expr>,
    },
    /// `Fn::If`: picks a branch by condition name.
    If {
        /// Condition name.
        condition: String,
        /// Value when the condition holds.
        then: Box<Expr>,
        /// Value otherwise.
        otherwise: Box<Expr>,
    },
    /// `Fn::Equals`.
    Equals(Box<Expr>, Box<Expr>),
    /// `Fn::And`.
    And(Vec<Expr>),
    /// `Fn::Or`.
    Or(Vec<Expr>),
    /// `Fn::Not`.
    Not(Box<Expr>),
    /// `Condition`: the value of a named condition.
    Condition(String),
    /// `Fn::Join`.
    Join {
        /// Separator.
        delimiter: String,
        /// Expression producing the list to join.
        items: Box<Expr>,
    },
    /// `Fn::Select`.
    Select {
        /// Index expression.
        index: Box<Expr>,
        /// Expression producing the list.
        list: Box<Expr>,
    },
    /// `Fn::Split`.
    Split {
        /// Separator.
        delimiter: String,
        /// Expression producing the string.
        source: Box<Expr>,
    },
}

/// A piece of an `Fn::Sub` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubPart {
    /// Literal text.
    Text(String),
    /// A `${Name}` or `${Resource.Attribute}` placeholder.
    Name(String),
}

/// A name referenced by an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A bare name (`Ref` or `${Name}`).
    Name(String),
    /// A resource attribute.
    Attribute {
        /// Logical name of the resource.
        resource: String,
        /// Attribute name.
        attribute: String,
    },
    /// A condition name (`Fn::If`, `Condition`).
    Condition(String),
}

impl Reference {
    /// Returns the resource or parameter name this reference points at.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Name(name) | Self::Condition(name) => name,
            Self::Attribute { resource, .. } => resource,
        }
    }
}

impl Expr {
    /// Parses a YAML node into an expression.
    ///
    /// # Errors
    ///
    /// Returns an error if an intrinsic function is malformed or unsupported.
    pub fn parse(node: &Yaml, path: &str) -> Result<Self, TemplateError> {
        match node {
            Yaml::Null => Ok(Self::Null),
            Yaml::Bool(b) => Ok(Self::Bool(*b)),
            Yaml::Number(n) => Ok(Self::Number(yaml_number(n, path)?)),
            Yaml::String(s) => Ok(Self::String(s.clone())),
            Yaml::Sequence(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| Self::parse(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Yaml::Mapping(mapping) => {
                if mapping.len() == 1
                    && let Some((Yaml::String(key), value)) = mapping.iter().next()
                    && is_intrinsic_key(key)
                {
                    return Self::parse_intrinsic(key, value, path);
                }

                let mut map = IndexMap::with_capacity(mapping.len());
                for (key, value) in mapping {
                    let key = yaml_key(key, path)?;
                    let child = Self::parse(value, &format!("{path}.{key}"))?;
                    map.insert(key, child);
                }
                Ok(Self::Map(map))
            }
            Yaml::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                let short = tag.trim_start_matches('!');
                let function = match short {
                    "Ref" | "Condition" => short.to_string(),
                    other => format!("Fn::{other}"),
                };
                Self::parse_intrinsic(&function, &tagged.value, path)
            }
        }
    }

    /// Parses the argument of an intrinsic function.
    fn parse_intrinsic(function: &str, arg: &Yaml, path: &str) -> Result<Self, TemplateError> {
        let at = format!("{path}.{function}");
        match function {
            "Ref" => Ok(Self::Ref(expect_string(arg, &at)?)),
            "Condition" => Ok(Self::Condition(expect_string(arg, &at)?)),
            "Fn::GetAtt" => match arg {
                Yaml::String(s) => {
                    let (resource, attribute) = s.split_once('.').ok_or_else(|| {
                        TemplateError::invalid(&at, format!("expected 'Resource.Attribute', got '{s}'"))
                    })?;
                    Ok(Self::GetAtt {
                        resource: resource.to_string(),
                        attribute: attribute.to_string(),
                    })
                }
                Yaml::Sequence(items) if items.len() == 2 => Ok(Self::GetAtt {
                    resource: expect_string(&items[0], &at)?,
                    attribute: expect_string(&items[1], &at)?,
                }),
                _ => Err(TemplateError::invalid(at, "expected [Resource, Attribute]")),
            },
            "Fn::Sub" => match arg {
                Yaml::String(template) => Ok(Self::Sub {
                    parts: parse_sub_template(template, &at)?,
                    variables: IndexMap::new(),
                }),
                Yaml::Sequence(items) if items.len() == 2 => {
                    let template = expect_string(&items[0], &at)?;
                    let Yaml::Mapping(vars) = &items[1] else {
                        return Err(TemplateError::invalid(at, "variables must be a mapping"));
                    };
                    let mut variables = IndexMap::with_capacity(vars.len());
                    for (key, value) in vars {
                        let key = yaml_key(key, &at)?;
                        let child = Self::parse(value, &format!("{at}.{key}"))?;
                        variables.insert(key, child);
                    }
                    Ok(Self::Sub {
                        parts: parse_sub_template(&template, &at)?,
                        variables,
                    })
                }
                _ => Err(TemplateError::invalid(at, "expected a string or [template, variables]")),
            },
            "Fn::If" => {
                let items = expect_list(arg, 3, &at)?;
                Ok(Self::If {
                    condition: expect_string(&items[0], &at)?,
                    then: Box::new(Self::parse(&items[1], &format!("{at}[1]"))?),
                    otherwise: Box::new(Self::parse(&items[2], &format!("{at}[2]"))?),
                })
            }
            "Fn::Equals" => {
                let items = expect_list(arg, 2, &at)?;
                Ok(Self::Equals(
                    Box::new(Self::parse(&items[0], &format!("{at}[0]"))?),
                    Box::new(Self::parse(&items[1], &format!("{at}[1]"))?),
                ))
            }
            "Fn::And" | "Fn::Or" => {
                let Yaml::Sequence(items) = arg else {
                    return Err(TemplateError::invalid(at, "expected a list of conditions"));
                };
                if !(2..=10).contains(&items.len()) {
                    return Err(TemplateError::invalid(at, "expected between 2 and 10 conditions"));
                }
                let operands = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Self::parse(item, &format!("{at}[{i}]")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if function == "Fn::And" {
                    Self::And(operands)
                } else {
                    Self::Or(operands)
                })
            }
            "Fn::Not" => {
                let items = expect_list(arg, 1, &at)?;
                Ok(Self::Not(Box::new(Self::parse(&items[0], &format!("{at}[0]"))?)))
            }
            "Fn::Join" => {
                let items = expect_list(arg, 2, &at)?;
                Ok(Self::Join {
                    delimiter: expect_string(&items[0], &at)?,
                    items: Box::new(Self::parse(&items[1], &format!("{at}[1]"))?),
                })
            }
            "Fn::Select" => {
                let items = expect_list(arg, 2, &at)?;
                Ok(Self::Select {
                    index: Box::new(Self::parse(&items[0], &format!("{at}[0]"))?),
                    list: Box::new(Self::parse(&items[1], &format!("{at}[1]"))?),
                })
            }
            "Fn::Split" => {
                let items = expect_list(arg, 2, &at)?;
                Ok(Self::Split {
                    delimiter: expect_string(&items[0], &at)?,
                    source: Box::new(Self::parse(&items[1], &format!("{at}[1]"))?),
                })
            }
            other => Err(TemplateError::invalid(
                path,
                format!("unsupported intrinsic function '{other}'"),
            )),
        }
    }

    /// Collects every name this expression refers to, including names in
    /// branches that may not be taken.
    pub fn collect_references(&self, out: &mut Vec<Reference>) {
        match self {
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => {}
            Self::List(items) | Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_references(out);
                }
            }
            Self::Ref(name) => out.push(Reference::Name(name.clone())),
            Self::GetAtt { resource, attribute } => out.push(Reference::Attribute {
                resource: resource.clone(),
                attribute: attribute.clone(),
            }),
            Self::Sub { parts, variables } => {
                for value in variables.values() {
                    value.collect_references(out);
                }
                for part in parts {
                    if let SubPart::Name(name) = part
                        && !variables.contains_key(name)
                    {
                        out.push(sub_reference(name));
                    }
                }
            }
            Self::If { condition, then, otherwise } => {
                out.push(Reference::Condition(condition.clone()));
                then.collect_references(out);
                otherwise.collect_references(out);
            }
            Self::Equals(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Self::Not(inner) => inner.collect_references(out),
            Self::Condition(name) => out.push(Reference::Condition(name.clone())),
            Self::Join { items, .. } => items.collect_references(out),
            Self::Select { index, list } => {
                index.collect_references(out);
                list.collect_references(out);
            }
            Self::Split { source, .. } => source.collect_references(out),
        }
    }

    /// Returns every referenced name.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }
}

/// Interprets a `${...}` placeholder as a reference.
#[must_use]
pub fn sub_reference(name: &str) -> Reference {
    match name.split_once('.') {
        Some((resource, attribute)) => Reference::Attribute {
            resource: resource.to_string(),
            attribute: attribute.to_string(),
        },
        None => Reference::Name(name.to_string()),
    }
}

/// Splits an `Fn::Sub` template into literal text and placeholders.
fn parse_sub_template(template: &str, path: &str) -> Result<Vec<SubPart>, TemplateError> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(open) = rest.find("${") {
        text.push_str(&rest[..open]);
        let after = &rest[open + 2..];

        // ${!Literal} renders as ${Literal}
        if let Some(literal) = after.strip_prefix('!') {
            text.push_str("${");
            rest = literal;
            continue;
        }

        let close = after
            .find('}')
            .ok_or_else(|| TemplateError::invalid(path, format!("unclosed placeholder in '{template}'")))?;
        let name = after[..close].trim();
        if name.is_empty() {
            return Err(TemplateError::invalid(path, "empty placeholder '${}'"));
        }

        if !text.is_empty() {
            parts.push(SubPart::Text(std::mem::take(&mut text)));
        }
        parts.push(SubPart::Name(name.to_string()));
        rest = &after[close + 1..];
    }

    text.push_str(rest);
    if !text.is_empty() {
        parts.push(SubPart::Text(text));
    }
    Ok(parts)
}

fn is_intrinsic_key(key: &str) -> bool {
    key == "Ref" || key == "Condition" || key.starts_with("Fn::")
}

fn yaml_number(n: &serde_yaml::Number, path: &str) -> Result<serde_json::Number, TemplateError> {
    if let Some(i) = n.as_i64() {
        Ok(serde_json::Number::from(i))
    } else if let Some(u) = n.as_u64() {
        Ok(serde_json::Number::from(u))
    } else {
        n.as_f64()
            .and_then(serde_json::Number::from_f64)
            .ok_or_else(|| TemplateError::invalid(path, format!("unsupported number {n}")))
    }
}

fn yaml_key(key: &Yaml, path: &str) -> Result<String, TemplateError> {
    match key {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        _ => Err(TemplateError::invalid(path, "mapping keys must be scalars")),
    }
}

fn expect_string(node: &Yaml, path: &str) -> Result<String, TemplateError> {
    match node {
        Yaml::String(s) => Ok(s.clone()),
        _ => Err(TemplateError::invalid(path, "expected a string")),
    }
}

fn expect_list<'a>(node: &'a Yaml, len: usize, path: &str) -> Result<&'a [Yaml], TemplateError> {
    match node {
        Yaml::Sequence(items) if items.len() == len => Ok(items),
        _ => Err(TemplateError::invalid(path, format!("expected a list of {len} items"))),
    }
}
