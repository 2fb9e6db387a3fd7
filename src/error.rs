//! Error types for the Strata provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, template loading, validation, state management, provider
//! calls and plan execution.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Strata engine.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Engine configuration errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Template loading and structure errors.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Validation errors detected before any provider call.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider plugin errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Plan execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation of the configuration failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// An environment override could not be applied.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Template loading and structural errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template file was not found.
    #[error("Template file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The template document could not be parsed.
    #[error("Failed to parse template: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// The template is structurally invalid.
    #[error("Invalid template at {path}: {message}")]
    InvalidStructure {
        /// Dotted path to the offending node.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// The same name is declared twice across sections.
    #[error("Duplicate name '{name}' declared in {first} and {second}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
        /// Section of the first declaration.
        first: String,
        /// Section of the second declaration.
        second: String,
    },
}

/// Errors detected while validating a plan. Nothing is mutated when one of
/// these is raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A parameter without a default was not supplied.
    #[error("Missing required parameter: {name}")]
    MissingRequiredParameter {
        /// Parameter name.
        name: String,
    },

    /// A parameter value violates its allowed values or constraints.
    #[error("Invalid value for parameter {name}: {reason}")]
    InvalidParameterValue {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
        /// Constraint that was violated.
        reason: String,
    },

    /// A parameter value cannot be coerced to the declared type.
    #[error("Parameter {name} expects {expected}, got '{value}'")]
    TypeMismatch {
        /// Parameter name.
        name: String,
        /// Declared type.
        expected: String,
        /// Offending value.
        value: String,
    },

    /// A condition or parameter name is not defined.
    #[error("Unknown identifier '{name}' in {context}")]
    UnknownIdentifier {
        /// Where the identifier was used.
        context: String,
        /// The undefined name.
        name: String,
    },

    /// A reference does not resolve to any declared entity.
    #[error("Unresolved reference '{reference}' in {context}")]
    UnresolvedReference {
        /// Where the reference was used.
        context: String,
        /// The reference text.
        reference: String,
    },

    /// A reference targets a resource whose guard condition is false.
    #[error("{context} references '{target}', which is excluded by its condition")]
    DanglingReference {
        /// Where the reference was used.
        context: String,
        /// The guarded-out resource.
        target: String,
    },

    /// The resource dependency graph has a cycle.
    #[error("Cyclic dependency between resources: {}", resources.join(" -> "))]
    CyclicDependency {
        /// Resources participating in the cycle.
        resources: Vec<String>,
    },

    /// An intrinsic expression is malformed or ill-typed.
    #[error("Invalid expression in {context}: {message}")]
    InvalidExpression {
        /// Where the expression appears.
        context: String,
        /// Description of the problem.
        message: String,
    },

    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}' (resource {resource})")]
    UnknownResourceType {
        /// Logical name of the resource.
        resource: String,
        /// The unsupported type.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Storage backend IO failure.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Another plan changed or holds the state target.
    #[error("Concurrent modification of state: expected version {expected}, found {found}{}", holder.as_ref().map(|h| format!(" (lease held by {h})")).unwrap_or_default())]
    ConcurrentModification {
        /// Version the caller planned against.
        expected: u64,
        /// Version currently stored.
        found: u64,
        /// Holder of the competing lease, if any.
        holder: Option<String>,
    },

    /// The caller's lease is not the one currently held.
    #[error("State lease {lease_id} is not held")]
    LeaseNotHeld {
        /// Lease identifier presented by the caller.
        lease_id: String,
    },

    /// State format version mismatch.
    #[error("State format version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected format version.
        expected: String,
        /// Found format version.
        found: String,
    },
}

/// Errors reported by resource provider plugins.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider rejected or failed the operation.
    #[error("{operation} failed for {resource_type}: {message}")]
    OperationFailed {
        /// Operation name.
        operation: String,
        /// Resource type.
        resource_type: String,
        /// Provider message.
        message: String,
    },

    /// The physical resource does not exist.
    #[error("Physical resource not found: {physical_id}")]
    NotFound {
        /// Provider-assigned identifier.
        physical_id: String,
    },

    /// The provider is temporarily unavailable.
    #[error("Provider unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// The operation did not complete within the provider timeout.
    #[error("{operation} on {resource} timed out after {elapsed_secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Logical name or physical id.
        resource: String,
        /// Seconds waited.
        elapsed_secs: u64,
    },
}

/// A resource step that failed during execution or rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Logical name of the resource.
    pub resource: String,
    /// Operation that failed.
    pub operation: String,
    /// Failure description.
    pub message: String,
}

/// Plan execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Execution failed and every touched resource was restored.
    #[error("Execution failed ({}), changes rolled back", summarize(failures))]
    RolledBack {
        /// Steps that failed.
        failures: Vec<StepFailure>,
        /// Whether the run was cancelled.
        cancelled: bool,
    },

    /// Execution failed and rollback could not restore every resource.
    #[error("Rollback incomplete, resources in indeterminate state: {}", indeterminate.join(", "))]
    RollbackIncomplete {
        /// Steps that failed during execution.
        failures: Vec<StepFailure>,
        /// Rollback operations that exhausted their retries.
        rollback_failures: Vec<StepFailure>,
        /// Resources left in an indeterminate state.
        indeterminate: Vec<String>,
    },

    /// A plan was computed against a different state version.
    #[error("Plan is stale: computed against state version {planned}, current is {current}")]
    StalePlan {
        /// Version the plan was computed against.
        planned: u64,
        /// Current version.
        current: u64,
    },
}

fn summarize(failures: &[StepFailure]) -> String {
    if failures.is_empty() {
        return String::from("cancelled");
    }
    failures
        .iter()
        .map(|f| format!("{} {}: {}", f.operation, f.resource, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Process exit code for a successful run.
pub const EXIT_SUCCESS: u8 = 0;
/// Process exit code for a validation failure.
pub const EXIT_VALIDATION: u8 = 1;
/// Process exit code for an execution failure that was rolled back.
pub const EXIT_ROLLED_BACK: u8 = 2;
/// Process exit code for an execution failure with incomplete rollback.
pub const EXIT_ROLLBACK_INCOMPLETE: u8 = 3;

impl StrataError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the error was detected before anything was mutated.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Template(_)
                | Self::Config(_)
                | Self::State(StateError::ConcurrentModification { .. })
        )
    }

    /// Maps the error onto the CLI exit code contract.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Execution(ExecutionError::RollbackIncomplete { .. }) => EXIT_ROLLBACK_INCOMPLETE,
            Self::Execution(ExecutionError::RolledBack { .. }) => EXIT_ROLLED_BACK,
            _ => EXIT_VALIDATION,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl TemplateError {
    /// Creates a structural error at the given path.
    #[must_use]
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(
        operation: impl Into<String>,
        resource_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            resource_type: resource_type.into(),
            message: message.into(),
        }
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl ValidationError {
    /// Creates an invalid expression error.
    #[must_use]
    pub fn expression(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            context: context.into(),
            message: message.into(),
        }
    }
}
