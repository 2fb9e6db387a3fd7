//! Template parser.
//!
//! Loads YAML or JSON templates into [`Template`]. JSON is accepted because it
//! is a subset of the YAML the parser reads.

use indexmap::IndexMap;
use serde_yaml::{Mapping, Value as Yaml};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, StrataError, TemplateError};

use super::expr::Expr;
use super::types::{
    DeletionPolicy, OutputDecl, ParameterDecl, ParameterType, ResourceDecl, Template,
};

/// Top-level sections the parser understands.
const KNOWN_SECTIONS: &[&str] = &[
    "AWSTemplateFormatVersion",
    "Description",
    "Metadata",
    "Parameters",
    "Conditions",
    "Resources",
    "Outputs",
];

/// Parser for template documents.
#[derive(Debug, Default)]
pub struct TemplateParser;

impl TemplateParser {
    /// Creates a new template parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Loads and parses a template file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the template is invalid.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(Template, String)> {
        let path = path.as_ref();
        info!("Loading template from: {}", path.display());

        if !path.exists() {
            return Err(StrataError::Template(TemplateError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let source = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Template(TemplateError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let template = self
            .parse_str(&source)
            .map_err(|e| match e {
                StrataError::Template(TemplateError::ParseError { message, .. }) => {
                    StrataError::Template(TemplateError::ParseError {
                        message,
                        location: Some(path.display().to_string()),
                    })
                }
                other => other,
            })?;
        Ok((template, source))
    }

    /// Parses a template from a YAML or JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or structurally invalid.
    pub fn parse_str(&self, source: &str) -> Result<Template> {
        debug!("Parsing template document");

        let document: Yaml = serde_yaml::from_str(source).map_err(|e| {
            StrataError::Template(TemplateError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: None,
            })
        })?;

        let Yaml::Mapping(root) = document else {
            return Err(TemplateError::invalid("$", "template must be a mapping").into());
        };

        for key in root.keys() {
            let name = key_string(key, "$")?;
            if !KNOWN_SECTIONS.contains(&name.as_str()) {
                return Err(TemplateError::invalid("$", format!("unsupported section '{name}'")).into());
            }
        }

        let template = Template {
            description: optional_string(&root, "Description", "$")?,
            parameters: section(&root, "Parameters", parse_parameter)?,
            conditions: section(&root, "Conditions", |name, node| {
                Ok(Expr::parse(node, &format!("Conditions.{name}"))?)
            })?,
            resources: section(&root, "Resources", parse_resource)?,
            outputs: section(&root, "Outputs", parse_output)?,
        };

        check_names(&template)?;

        debug!(
            "Parsed template with {} parameters, {} conditions, {} resources, {} outputs",
            template.parameters.len(),
            template.conditions.len(),
            template.resources.len(),
            template.outputs.len()
        );
        Ok(template)
    }
}

/// Parses every entry of a top-level section.
fn section<T>(
    root: &Mapping,
    name: &str,
    parse: impl Fn(&str, &Yaml) -> Result<T>,
) -> Result<IndexMap<String, T>> {
    let Some(node) = root.get(name) else {
        return Ok(IndexMap::new());
    };
    let entries = match node {
        Yaml::Mapping(entries) => entries,
        Yaml::Null => return Ok(IndexMap::new()),
        _ => return Err(TemplateError::invalid(name, "section must be a mapping").into()),
    };

    let mut out = IndexMap::with_capacity(entries.len());
    for (key, value) in entries {
        let entry = key_string(key, name)?;
        if !is_logical_name(&entry) {
            return Err(TemplateError::invalid(
                format!("{name}.{entry}"),
                "names must be non-empty and alphanumeric",
            )
            .into());
        }
        let parsed = parse(&entry, value)?;
        out.insert(entry, parsed);
    }
    Ok(out)
}

fn parse_parameter(name: &str, node: &Yaml) -> Result<ParameterDecl> {
    let path = format!("Parameters.{name}");
    let Yaml::Mapping(fields) = node else {
        return Err(TemplateError::invalid(path, "parameter must be a mapping").into());
    };

    let raw_type = optional_string(fields, "Type", &path)?
        .ok_or_else(|| TemplateError::invalid(&path, "missing Type"))?;
    let param_type = ParameterType::parse(&raw_type)
        .ok_or_else(|| TemplateError::invalid(&path, format!("unsupported parameter type '{raw_type}'")))?;

    let mut decl = ParameterDecl::new(name, param_type);

    for (key, value) in fields {
        let field = key_string(key, &path)?;
        let at = format!("{path}.{field}");
        match field.as_str() {
            "Type" => {}
            "Default" => decl.default = Some(scalar_or_list(value, &at)?),
            "AllowedValues" => {
                let Yaml::Sequence(items) = value else {
                    return Err(TemplateError::invalid(at, "expected a list").into());
                };
                decl.allowed_values = items
                    .iter()
                    .map(|item| scalar_string(item, &at))
                    .collect::<Result<_>>()?;
            }
            "AllowedPattern" => {
                let pattern = scalar_string(value, &at)?;
                regex::Regex::new(&pattern).map_err(|e| {
                    TemplateError::invalid(&at, format!("invalid pattern: {e}"))
                })?;
                decl.allowed_pattern = Some(pattern);
            }
            "MinLength" => decl.min_length = Some(unsigned(value, &at)?),
            "MaxLength" => decl.max_length = Some(unsigned(value, &at)?),
            "MinValue" => decl.min_value = Some(float(value, &at)?),
            "MaxValue" => decl.max_value = Some(float(value, &at)?),
            "NoEcho" => decl.no_echo = boolean(value, &at)?,
            "Description" => decl.description = Some(scalar_string(value, &at)?),
            "ConstraintDescription" => decl.constraint_description = Some(scalar_string(value, &at)?),
            other => {
                return Err(TemplateError::invalid(path, format!("unsupported field '{other}'")).into());
            }
        }
    }

    Ok(decl)
}

fn parse_resource(name: &str, node: &Yaml) -> Result<ResourceDecl> {
    let path = format!("Resources.{name}");
    let Yaml::Mapping(fields) = node else {
        return Err(TemplateError::invalid(path, "resource must be a mapping").into());
    };

    let resource_type = optional_string(fields, "Type", &path)?
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TemplateError::invalid(&path, "missing Type"))?;
    let mut decl = ResourceDecl::new(name, resource_type);

    for (key, value) in fields {
        let field = key_string(key, &path)?;
        let at = format!("{path}.{field}");
        match field.as_str() {
            "Type" | "Metadata" | "UpdateReplacePolicy" => {}
            "Properties" => match value {
                Yaml::Mapping(props) => {
                    for (prop, prop_value) in props {
                        let prop = key_string(prop, &at)?;
                        let expr = Expr::parse(prop_value, &format!("{at}.{prop}"))?;
                        decl.properties.insert(prop, expr);
                    }
                }
                Yaml::Null => {}
                _ => return Err(TemplateError::invalid(at, "Properties must be a mapping").into()),
            },
            "Condition" => decl.condition = Some(scalar_string(value, &at)?),
            "DependsOn" => {
                decl.depends_on = match value {
                    Yaml::String(s) => vec![s.clone()],
                    Yaml::Sequence(items) => items
                        .iter()
                        .map(|item| scalar_string(item, &at))
                        .collect::<Result<_>>()?,
                    _ => return Err(TemplateError::invalid(at, "expected a name or list of names").into()),
                };
            }
            "DeletionPolicy" => {
                decl.deletion_policy = match scalar_string(value, &at)?.as_str() {
                    "Delete" => DeletionPolicy::Delete,
                    "Retain" => DeletionPolicy::Retain,
                    other => {
                        return Err(TemplateError::invalid(at, format!("unsupported policy '{other}'")).into());
                    }
                };
            }
            other => {
                return Err(TemplateError::invalid(path, format!("unsupported field '{other}'")).into());
            }
        }
    }

    Ok(decl)
}

fn parse_output(name: &str, node: &Yaml) -> Result<OutputDecl> {
    let path = format!("Outputs.{name}");
    let Yaml::Mapping(fields) = node else {
        return Err(TemplateError::invalid(path, "output must be a mapping").into());
    };

    let value = fields
        .get("Value")
        .ok_or_else(|| TemplateError::invalid(&path, "missing Value"))?;

    Ok(OutputDecl {
        name: name.to_string(),
        value: Expr::parse(value, &format!("{path}.Value"))?,
        condition: optional_string(fields, "Condition", &path)?,
        description: optional_string(fields, "Description", &path)?,
    })
}

/// Parameters and resources share the `Ref` namespace.
fn check_names(template: &Template) -> Result<()> {
    for name in template.resources.keys() {
        if template.parameters.contains_key(name) {
            return Err(TemplateError::DuplicateName {
                name: name.clone(),
                first: String::from("Parameters"),
                second: String::from("Resources"),
            }
            .into());
        }
    }
    Ok(())
}

fn is_logical_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

fn key_string(key: &Yaml, path: &str) -> Result<String> {
    match key {
        Yaml::String(s) => Ok(s.clone()),
        _ => Err(TemplateError::invalid(path, "keys must be strings").into()),
    }
}

fn optional_string(map: &Mapping, key: &str, path: &str) -> Result<Option<String>> {
    map.get(key)
        .map(|value| scalar_string(value, &format!("{path}.{key}")))
        .transpose()
}

fn scalar_string(node: &Yaml, path: &str) -> Result<String> {
    match node {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        _ => Err(TemplateError::invalid(path, "expected a scalar").into()),
    }
}

/// Defaults may be written as a YAML list for list-typed parameters.
fn scalar_or_list(node: &Yaml, path: &str) -> Result<String> {
    match node {
        Yaml::Sequence(items) => Ok(items
            .iter()
            .map(|item| scalar_string(item, path))
            .collect::<Result<Vec<_>>>()?
            .join(",")),
        other => scalar_string(other, path),
    }
}

fn unsigned(node: &Yaml, path: &str) -> Result<usize> {
    scalar_string(node, path)?
        .parse()
        .map_err(|_| TemplateError::invalid(path, "expected a non-negative integer").into())
}

fn float(node: &Yaml, path: &str) -> Result<f64> {
    scalar_string(node, path)?
        .parse()
        .map_err(|_| TemplateError::invalid(path, "expected a number").into())
}

fn boolean(node: &Yaml, path: &str) -> Result<bool> {
    match scalar_string(node, path)?.as_str() {
        "true" | "True" => Ok(true),
        "false" | "False" => Ok(false),
        _ => Err(TemplateError::invalid(path, "expected a boolean").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOAD_BALANCER: &str = r"
AWSTemplateFormatVersion: '2010-09-09'
Description: Application load balancer
Parameters:
  Port:
    Type: Number
    Default: 80
    AllowedValues: [80, 443]
  Subnets:
    Type: List<AWS::EC2::Subnet::Id>
    Default: [subnet-a, subnet-b]
Conditions:
  UseHttps: !Equals [!Ref Port, 443]
Resources:
  SecurityGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: web
  LogBucket:
    Type: AWS::S3::Bucket
    Condition: UseHttps
    DeletionPolicy: Retain
  LoadBalancer:
    Type: AWS::ElasticLoadBalancingV2::LoadBalancer
    DependsOn: SecurityGroup
    Properties:
      Subnets: !Ref Subnets
      SecurityGroups: [!GetAtt SecurityGroup.GroupId]
Outputs:
  LoadBalancerArn:
    Value: !Ref LoadBalancer
    Description: ARN
";

    #[test]
    fn test_parse_full_template() {
        let template = TemplateParser::new().parse_str(LOAD_BALANCER).unwrap();

        assert_eq!(template.description.as_deref(), Some("Application load balancer"));
        assert_eq!(template.parameters["Port"].default.as_deref(), Some("80"));
        assert_eq!(template.parameters["Port"].allowed_values, vec!["80", "443"]);
        assert_eq!(template.parameters["Subnets"].default.as_deref(), Some("subnet-a,subnet-b"));
        assert_eq!(template.conditions.len(), 1);

        let names: Vec<_> = template.resources.keys().cloned().collect();
        assert_eq!(names, vec!["SecurityGroup", "LogBucket", "LoadBalancer"]);
        assert_eq!(template.resources["LogBucket"].condition.as_deref(), Some("UseHttps"));
        assert_eq!(template.resources["LogBucket"].deletion_policy, DeletionPolicy::Retain);
        assert_eq!(template.resources["LoadBalancer"].depends_on, vec!["SecurityGroup"]);
        assert_eq!(template.outputs["LoadBalancerArn"].value, Expr::Ref(String::from("LoadBalancer")));
    }

    #[test]
    fn test_parse_json_template() {
        let json = r#"{
            "Resources": {
                "Queue": { "Type": "AWS::SQS::Queue", "Properties": { "DelaySeconds": 5 } }
            }
        }"#;
        let template = TemplateParser::new().parse_str(json).unwrap();
        assert_eq!(template.resources["Queue"].resource_type, "AWS::SQS::Queue");
    }

    #[test]
    fn test_parameter_resource_name_clash() {
        let yaml = r"
Parameters:
  Bucket: { Type: String }
Resources:
  Bucket: { Type: AWS::S3::Bucket }
";
        let err = TemplateParser::new().parse_str(yaml).unwrap_err();
        assert!(matches!(err, StrataError::Template(TemplateError::DuplicateName { .. })));
    }

    #[test]
    fn test_rejects_invalid_structure() {
        let parser = TemplateParser::new();
        assert!(parser.parse_str("Resources:\n  Bad-Name: { Type: X::Y }\n").is_err());
        assert!(parser.parse_str("Resources:\n  Thing: { Properties: {} }\n").is_err());
        assert!(parser.parse_str("Mappings: {}\n").is_err());
        assert!(parser.parse_str("- not a mapping\n").is_err());
        assert!(parser.parse_str("Parameters:\n  P: { Type: Integer }\n").is_err());
    }

    #[test]
    fn test_load_file_missing() {
        let err = TemplateParser::new().load_file("/nonexistent/template.yaml").unwrap_err();
        assert!(matches!(err, StrataError::Template(TemplateError::FileNotFound { .. })));
    }
}
