//! Resource provider plugins.
//!
//! Concrete resource types are opaque to the engine. Each type is served by a
//! [`ResourceProvider`] that declares a schema (which fields are mutable in
//! place, which force replacement, how long operations may take) and
//! implements create, update, delete and polling of asynchronous operations.

mod operation;
mod sandbox;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProviderError, ValidationError};
use crate::template::Properties;

pub use operation::{MIN_POLL_INTERVAL, Operation, OperationDriver};
pub use sandbox::SandboxProvider;

/// How a field that is neither listed mutable nor replacement-triggering is
/// treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldPolicy {
    /// Change in place.
    Update,
    /// Replace the resource.
    #[default]
    Replace,
}

/// Order of operations when a resource is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplacementStrategy {
    /// Create the new resource, rewire dependents, then delete the old one.
    #[default]
    CreateBeforeDelete,
    /// Delete the old resource, then create the new one.
    DeleteBeforeCreate,
}

/// Schema a provider declares for a resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSchema {
    /// Fields that can be changed in place.
    pub mutable_fields: BTreeSet<String>,
    /// Fields whose change forces replacement.
    pub replacement_fields: BTreeSet<String>,
    /// Policy for fields in neither set.
    pub unlisted: FieldPolicy,
    /// Replacement ordering.
    pub replacement: ReplacementStrategy,
    /// Initial interval between polls of a pending operation.
    pub poll_interval: Duration,
    /// Maximum time an operation may take.
    pub timeout: Duration,
    /// Retry cap for rollback operations.
    pub max_retries: u32,
}

impl Default for ProviderSchema {
    fn default() -> Self {
        Self {
            mutable_fields: BTreeSet::new(),
            replacement_fields: BTreeSet::new(),
            unlisted: FieldPolicy::Replace,
            replacement: ReplacementStrategy::CreateBeforeDelete,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
            max_retries: 3,
        }
    }
}

impl ProviderSchema {
    /// Sets the mutable fields.
    #[must_use]
    pub fn with_mutable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the replacement-triggering fields.
    #[must_use]
    pub fn with_replacement<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replacement_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the replacement strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ReplacementStrategy) -> Self {
        self.replacement = strategy;
        self
    }

    /// Sets the poll interval and timeout.
    #[must_use]
    pub const fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Sets the retry cap.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns true if changing the field forces replacement.
    #[must_use]
    pub fn requires_replacement(&self, field: &str) -> bool {
        if self.replacement_fields.contains(field) {
            true
        } else if self.mutable_fields.contains(field) {
            false
        } else {
            self.unlisted == FieldPolicy::Replace
        }
    }
}

/// Result of a completed provider operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderOutput {
    /// Physical id; required for creates, optional otherwise.
    pub physical_id: Option<String>,
    /// Provider-reported attributes.
    pub attributes: Properties,
}

/// Immediate response to a create, update or delete call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// The operation finished synchronously.
    Done(ProviderOutput),
    /// The operation is running and must be polled.
    InProgress {
        /// Provider operation handle.
        operation_id: String,
    },
}

/// Status of a polled operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Done(ProviderOutput),
    /// Finished with an error.
    Failed(String),
}

/// A provider plugin serving one or more resource types.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Describes the schema of a resource type.
    async fn describe_schema(&self, resource_type: &str) -> Result<ProviderSchema, ProviderError>;

    /// Creates a resource.
    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        properties: &Properties,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Updates a resource in place.
    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        previous: &Properties,
        properties: &Properties,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, physical_id: &str) -> Result<ProviderResponse, ProviderError>;

    /// Polls a pending operation.
    async fn poll(&self, resource_type: &str, operation_id: &str) -> Result<PollStatus, ProviderError>;
}

/// Maps resource types to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
    fallback: Option<Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for a resource type.
    pub fn register(&mut self, resource_type: impl Into<String>, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(resource_type.into(), provider);
    }

    /// Sets the provider used for types with no explicit registration.
    #[must_use]
    pub fn with_fallback(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    /// Gets the provider for a resource type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers
            .get(resource_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Gets the provider for a resource, failing validation if none serves
    /// its type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceType` if no provider is registered.
    pub fn provider_for(
        &self,
        resource: &str,
        resource_type: &str,
    ) -> Result<Arc<dyn ResourceProvider>, ValidationError> {
        self.get(resource_type).ok_or_else(|| ValidationError::UnknownResourceType {
            resource: resource.to_string(),
            resource_type: resource_type.to_string(),
        })
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.providers.keys().collect();
        types.sort();
        f.debug_struct("ProviderRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_replacement() {
        let schema = ProviderSchema::default()
            .with_mutable(["Tags", "Port"])
            .with_replacement(["VpcId"]);
        assert!(schema.requires_replacement("VpcId"));
        assert!(!schema.requires_replacement("Port"));
        assert!(schema.requires_replacement("Unlisted"));

        let lenient = ProviderSchema {
            unlisted: FieldPolicy::Update,
            ..schema
        };
        assert!(!lenient.requires_replacement("Unlisted"));
    }

    #[test]
    fn test_registry_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register("AWS::S3::Bucket", Arc::new(MockResourceProvider::new()));

        assert!(registry.get("AWS::S3::Bucket").is_some());
        assert!(matches!(
            registry.provider_for("Queue", "AWS::SQS::Queue"),
            Err(ValidationError::UnknownResourceType { .. })
        ));

        let registry = registry.with_fallback(Arc::new(MockResourceProvider::new()));
        assert!(registry.provider_for("Queue", "AWS::SQS::Queue").is_ok());
    }
}
