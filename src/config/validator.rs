//! Configuration validation.
//!
//! Checks engine configuration values for consistency before an engine is
//! built from them. Problems that would make a run fail are errors; odd but
//! workable settings are warnings.

use crate::error::{ConfigError, Result, StrataError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{EngineConfig, ExecutionConfig, SandboxConfig, SchemaConfig, StackConfig, StateBackend, StateConfig};

/// Placeholders understood in sandbox attribute templates.
const ATTRIBUTE_PLACEHOLDERS: &[&str] = &["id", "name", "region", "account", "partition"];

/// Worker counts above this are allowed but flagged.
const MAX_REASONABLE_WORKERS: usize = 64;

/// Validator for engine configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

/// All problems found in a configuration.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Errors that prevent a run.
    pub errors: Vec<ConfigIssue>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found, as a `ConfigError::ValidationError`.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationReport> {
        let report = self.check(config);

        match report.errors.first() {
            None => {
                debug!("Configuration validation passed");
                Ok(report)
            }
            Some(first) => Err(StrataError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            })),
        }
    }

    /// Collects every problem without failing.
    #[must_use]
    pub fn check(&self, config: &EngineConfig) -> ValidationReport {
        let mut report = ValidationReport::default();
        Self::validate_stack(&config.stack, &mut report);
        Self::validate_state(&config.state, &mut report);
        Self::validate_execution(&config.execution, &mut report);
        Self::validate_sandbox(&config.providers.sandbox, &mut report);
        report
    }

    fn validate_stack(stack: &StackConfig, report: &mut ValidationReport) {
        if stack.name.is_empty() {
            report.error("stack.name", "Stack name cannot be empty");
        } else if !is_valid_stack_name(&stack.name) {
            report.error(
                "stack.name",
                format!(
                    "Stack name '{}' is invalid. Must start with a letter and contain only letters, digits and hyphens.",
                    stack.name
                ),
            );
        }

        if stack.region.is_empty() {
            report.error("stack.region", "Region cannot be empty");
        }
        if stack.partition.is_empty() {
            report.error("stack.partition", "Partition cannot be empty");
        }
        if stack.account_id.len() != 12 || !stack.account_id.chars().all(|c| c.is_ascii_digit()) {
            report.warnings.push(format!(
                "stack.account_id: '{}' is not a 12-digit account number",
                stack.account_id
            ));
        }
    }

    fn validate_state(state: &StateConfig, report: &mut ValidationReport) {
        match state.backend {
            StateBackend::Local => {
                if state.path.is_empty() {
                    report.error("state.path", "State path is required for the local backend");
                }
            }
            StateBackend::Memory => {
                report
                    .warnings
                    .push(String::from("state.backend: memory state is lost when the process exits"));
            }
        }

        if state.lease_ttl_secs == 0 {
            report.error("state.lease_ttl_secs", "Lease TTL must be at least 1 second");
        }
    }

    fn validate_execution(execution: &ExecutionConfig, report: &mut ValidationReport) {
        if execution.max_workers == 0 {
            report.error("execution.max_workers", "At least one worker is required");
        } else if execution.max_workers > MAX_REASONABLE_WORKERS {
            report.warnings.push(format!(
                "execution.max_workers: {} concurrent provider operations is unusual",
                execution.max_workers
            ));
        }

        if execution.backoff_cap_secs == 0 {
            report.error("execution.backoff_cap_secs", "Backoff cap must be at least 1 second");
        }
    }

    fn validate_sandbox(sandbox: &SandboxConfig, report: &mut ValidationReport) {
        if sandbox.path.is_empty() {
            report.error("providers.sandbox.path", "Sandbox path cannot be empty");
        }

        Self::validate_schema(&sandbox.defaults, "providers.sandbox.defaults", report);

        for (resource_type, type_config) in &sandbox.types {
            let prefix = format!("providers.sandbox.types.{resource_type}");

            if !resource_type.contains("::") {
                report.warnings.push(format!(
                    "{prefix}: '{resource_type}' does not look like a resource type"
                ));
            }

            Self::validate_schema(&type_config.schema, &prefix, report);

            for (attribute, template) in &type_config.attributes {
                for placeholder in placeholders(template) {
                    if !ATTRIBUTE_PLACEHOLDERS.contains(&placeholder) {
                        report.warnings.push(format!(
                            "{prefix}.attributes.{attribute}: unknown placeholder '{{{placeholder}}}'"
                        ));
                    }
                }
            }
        }
    }

    fn validate_schema(schema: &SchemaConfig, prefix: &str, report: &mut ValidationReport) {
        let mutable: HashSet<&str> = schema.mutable.iter().map(String::as_str).collect();
        for field in &schema.replace {
            if mutable.contains(field.as_str()) {
                report.error(
                    format!("{prefix}.replace"),
                    format!("Field '{field}' is listed as both mutable and replacement-triggering"),
                );
            }
        }

        if schema.poll_interval_ms == 0 {
            report.error(format!("{prefix}.poll_interval_ms"), "Poll interval must be positive");
        }
        if schema.timeout_secs == 0 {
            report.error(format!("{prefix}.timeout_secs"), "Timeout must be positive");
        } else if schema.poll_interval_ms > schema.timeout_secs.saturating_mul(1000) {
            report.warnings.push(format!(
                "{prefix}: poll interval exceeds the operation timeout"
            ));
        }
    }
}

impl ValidationReport {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Stack names start with a letter and contain letters, digits and single
/// hyphens, without a trailing hyphen.
fn is_valid_stack_name(name: &str) -> bool {
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return false;
    }
    !name.ends_with('-') && !name.contains("--")
}

fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    template
        .split('{')
        .skip(1)
        .filter_map(|rest| rest.split_once('}').map(|(name, _)| name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxTypeConfig;

    #[test]
    fn test_valid_stack_name() {
        assert!(is_valid_stack_name("web"));
        assert!(is_valid_stack_name("Web-Tier-2"));
        assert!(is_valid_stack_name("a"));
    }

    #[test]
    fn test_invalid_stack_name() {
        assert!(!is_valid_stack_name(""));
        assert!(!is_valid_stack_name("2web"));
        assert!(!is_valid_stack_name("web_tier"));
        assert!(!is_valid_stack_name("web-"));
        assert!(!is_valid_stack_name("web--tier"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let report = ConfigValidator::new().validate(&EngineConfig::default()).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.warning_count(), 0);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EngineConfig::default();
        config.execution.max_workers = 0;
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Config(ConfigError::ValidationError { field: Some(ref f), .. })
                if f == "execution.max_workers"
        ));
    }

    #[test]
    fn test_conflicting_schema_fields() {
        let mut config = EngineConfig::default();
        config.providers.sandbox.types.insert(
            String::from("AWS::S3::Bucket"),
            SandboxTypeConfig {
                schema: SchemaConfig {
                    mutable: vec![String::from("BucketName")],
                    replace: vec![String::from("BucketName")],
                    ..SchemaConfig::default()
                },
                ..SandboxTypeConfig::default()
            },
        );
        let report = ConfigValidator::new().check(&config);
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.errors[0].field, "providers.sandbox.types.AWS::S3::Bucket.replace");
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let mut config = EngineConfig::default();
        config.state.backend = StateBackend::Memory;
        config.stack.account_id = String::from("dev");
        config.providers.sandbox.types.insert(
            String::from("AWS::S3::Bucket"),
            SandboxTypeConfig {
                attributes: [(String::from("Arn"), String::from("arn:{partition}:s3:::{bucket}"))]
                    .into_iter()
                    .collect(),
                ..SandboxTypeConfig::default()
            },
        );

        let report = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(report.warning_count(), 3);
        assert!(report.warnings.iter().any(|w| w.contains("'{bucket}'")));
    }
}
