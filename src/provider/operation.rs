//! Driving provider operations to completion.
//!
//! Providers may answer a call with a pending operation handle. The driver
//! polls it with exponential backoff, starting at the schema's poll interval
//! and doubling up to a cap, until it finishes or the schema timeout expires.

use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::template::Properties;

use super::{PollStatus, ProviderOutput, ProviderResponse, ProviderSchema, ResourceProvider};

/// Shortest wait between polls, whatever the schema asks for.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single provider call.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    /// Create a resource.
    Create {
        /// Logical name, passed to the provider for naming.
        logical_name: &'a str,
        /// Desired properties.
        properties: &'a Properties,
    },
    /// Update a resource in place.
    Update {
        /// Existing physical id.
        physical_id: &'a str,
        /// Last-applied properties.
        previous: &'a Properties,
        /// Desired properties.
        properties: &'a Properties,
    },
    /// Delete a resource.
    Delete {
        /// Existing physical id.
        physical_id: &'a str,
    },
}

impl Operation<'_> {
    /// Operation name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Issues operations and awaits their completion.
#[derive(Debug, Clone, Copy)]
pub struct OperationDriver {
    backoff_cap: Duration,
}

impl Default for OperationDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl OperationDriver {
    /// Creates a driver whose poll interval never exceeds `backoff_cap`.
    #[must_use]
    pub const fn new(backoff_cap: Duration) -> Self {
        Self { backoff_cap }
    }

    /// Runs an operation to completion.
    ///
    /// A delete of a resource that no longer exists counts as done.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or `Timeout` if the operation is still
    /// pending when the schema timeout expires.
    pub async fn run(
        &self,
        provider: &dyn ResourceProvider,
        resource_type: &str,
        schema: &ProviderSchema,
        resource: &str,
        operation: Operation<'_>,
    ) -> Result<ProviderOutput, ProviderError> {
        let started = Instant::now();
        debug!("Issuing {} for {} ({})", operation.name(), resource, resource_type);

        let response = match operation {
            Operation::Create { logical_name, properties } => {
                provider.create(resource_type, logical_name, properties).await
            }
            Operation::Update { physical_id, previous, properties } => {
                provider.update(resource_type, physical_id, previous, properties).await
            }
            Operation::Delete { physical_id } => match provider.delete(resource_type, physical_id).await {
                Err(ProviderError::NotFound { .. }) => {
                    warn!("{} ({}) was already gone", resource, physical_id);
                    return Ok(ProviderOutput::default());
                }
                other => other,
            },
        }?;

        let operation_id = match response {
            ProviderResponse::Done(output) => return Self::check(output, operation, resource_type),
            ProviderResponse::InProgress { operation_id } => operation_id,
        };

        let mut interval = self.pace(schema.poll_interval);
        loop {
            let elapsed = started.elapsed();
            if elapsed >= schema.timeout {
                return Err(ProviderError::Timeout {
                    operation: operation.name().to_string(),
                    resource: resource.to_string(),
                    elapsed_secs: elapsed.as_secs(),
                });
            }

            sleep(interval.min(schema.timeout - elapsed)).await;

            match provider.poll(resource_type, &operation_id).await? {
                PollStatus::InProgress => {
                    debug!("{} of {} still in progress", operation.name(), resource);
                    interval = self.pace(interval.saturating_mul(2));
                }
                PollStatus::Done(output) => return Self::check(output, operation, resource_type),
                PollStatus::Failed(message) => {
                    return Err(ProviderError::failed(operation.name(), resource_type, message));
                }
            }
        }
    }

    /// Runs an operation, retrying failures up to the schema's retry cap.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retries are exhausted.
    pub async fn run_with_retries(
        &self,
        provider: &dyn ResourceProvider,
        resource_type: &str,
        schema: &ProviderSchema,
        resource: &str,
        operation: Operation<'_>,
    ) -> Result<ProviderOutput, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.run(provider, resource_type, schema, resource, operation).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < schema.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} of {} failed (attempt {}/{}): {}",
                        operation.name(),
                        resource,
                        attempt,
                        schema.max_retries + 1,
                        e
                    );
                    sleep(self.pace(schema.poll_interval)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clamps a wait between polls to `[MIN_POLL_INTERVAL, backoff_cap]`.
    fn pace(&self, interval: Duration) -> Duration {
        interval.min(self.backoff_cap).max(MIN_POLL_INTERVAL)
    }

    fn check(
        output: ProviderOutput,
        operation: Operation<'_>,
        resource_type: &str,
    ) -> Result<ProviderOutput, ProviderError> {
        if matches!(operation, Operation::Create { .. }) && output.physical_id.is_none() {
            return Err(ProviderError::failed(
                "create",
                resource_type,
                "provider did not return a physical id",
            ));
        }
        Ok(output)
    }
}
