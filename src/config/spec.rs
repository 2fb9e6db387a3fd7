//! Engine configuration types.
//!
//! This module defines the structs that map to the `strata.yaml` file. Every
//! section is optional; a missing file yields the built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::planner::FailureMode;
use crate::provider::{FieldPolicy, ProviderSchema, ReplacementStrategy};
use crate::resolver::PseudoParameters;

/// The root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EngineConfig {
    /// Stack identity and pseudo-parameters.
    #[serde(default)]
    pub stack: StackConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Provider configuration.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Stack name, exposed as `AWS::StackName`.
    #[serde(default = "default_stack_name")]
    pub name: String,
    /// Target region, exposed as `AWS::Region`.
    #[serde(default = "default_region")]
    pub region: String,
    /// Target account, exposed as `AWS::AccountId`.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Partition, exposed as `AWS::Partition`.
    #[serde(default = "default_partition")]
    pub partition: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            region: default_region(),
            account_id: default_account_id(),
            partition: default_partition(),
        }
    }
}

impl StackConfig {
    /// Pseudo-parameters for this stack.
    #[must_use]
    pub fn pseudo_parameters(&self) -> PseudoParameters {
        PseudoParameters {
            region: self.region.clone(),
            account_id: self.account_id.clone(),
            stack_name: self.name.clone(),
            partition: self.partition.clone(),
        }
    }
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Directory holding the state and lease files (local backend).
    #[serde(default = "default_state_path")]
    pub path: String,
    /// Lease lifetime in seconds.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: default_state_path(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// In-process state, lost when the process exits.
    Memory,
}

/// Execution tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum concurrent provider operations.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// What to do when a step fails.
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Upper bound on the poll interval, in seconds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            failure_mode: FailureMode::default(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProvidersConfig {
    /// The built-in sandbox provider.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Sandbox provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxConfig {
    /// File holding the simulated cloud.
    #[serde(default = "default_sandbox_path")]
    pub path: String,
    /// Schema applied to types without their own entry.
    #[serde(default)]
    pub defaults: SchemaConfig,
    /// Per-type behavior.
    #[serde(default)]
    pub types: BTreeMap<String, SandboxTypeConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            path: default_sandbox_path(),
            defaults: SchemaConfig::default(),
            types: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Returns the settings for a resource type.
    #[must_use]
    pub fn type_config(&self, resource_type: &str) -> SandboxTypeConfig {
        self.types.get(resource_type).cloned().unwrap_or_else(|| SandboxTypeConfig {
            schema: self.defaults.clone(),
            attributes: BTreeMap::new(),
            pending_polls: 0,
        })
    }

    /// Path of the sandbox file.
    #[must_use]
    pub fn file(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// Sandbox behavior for one resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SandboxTypeConfig {
    /// Declared schema.
    #[serde(flatten)]
    pub schema: SchemaConfig,
    /// Computed attributes. Values may use `{id}`, `{name}`, `{region}`,
    /// `{account}` and `{partition}` placeholders.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Number of polls before an operation completes.
    #[serde(default)]
    pub pending_polls: u32,
}

/// A provider schema as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Fields that can be changed in place.
    #[serde(default)]
    pub mutable: Vec<String>,
    /// Fields whose change forces replacement.
    #[serde(default)]
    pub replace: Vec<String>,
    /// Policy for fields in neither list.
    #[serde(default)]
    pub unlisted: FieldPolicy,
    /// Replacement ordering.
    #[serde(default)]
    pub replacement: ReplacementStrategy,
    /// Initial poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Operation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retry cap for rollback operations.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            mutable: Vec::new(),
            replace: Vec::new(),
            unlisted: FieldPolicy::default(),
            replacement: ReplacementStrategy::default(),
            poll_interval_ms: default_poll_interval(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl SchemaConfig {
    /// Converts to the schema the engine works with.
    #[must_use]
    pub fn to_schema(&self) -> ProviderSchema {
        ProviderSchema {
            unlisted: self.unlisted,
            ..ProviderSchema::default()
        }
        .with_mutable(self.mutable.iter().cloned())
        .with_replacement(self.replace.iter().cloned())
        .with_strategy(self.replacement)
        .with_timing(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.timeout_secs),
        )
        .with_max_retries(self.max_retries)
    }
}

// Default value functions

fn default_stack_name() -> String {
    String::from("strata")
}

fn default_region() -> String {
    String::from("us-east-1")
}

fn default_account_id() -> String {
    String::from("123456789012")
}

fn default_partition() -> String {
    String::from("aws")
}

fn default_state_path() -> String {
    String::from(".strata")
}

fn default_sandbox_path() -> String {
    String::from(".strata/sandbox.json")
}

const fn default_lease_ttl() -> u64 {
    3600
}

const fn default_max_workers() -> usize {
    4
}

const fn default_backoff_cap() -> u64 {
    30
}

const fn default_poll_interval() -> u64 {
    1000
}

const fn default_timeout() -> u64 {
    600
}

const fn default_max_retries() -> u32 {
    3
}
