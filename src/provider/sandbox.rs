//! File-backed simulated cloud.
//!
//! The sandbox provider serves every resource type from a JSON file, so
//! templates can be planned, applied and destroyed end to end without any
//! network transport. Per-type schemas, computed attributes and simulated
//! operation latency come from the engine configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::ProviderError;
use crate::resolver::PseudoParameters;
use crate::template::{Properties, Value};

use super::{PollStatus, ProviderOutput, ProviderResponse, ProviderSchema, ResourceProvider};

/// A simulated physical resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResource {
    /// Resource type.
    pub resource_type: String,
    /// Logical name the resource was created for.
    pub logical_name: String,
    /// Current properties.
    pub properties: Properties,
    /// Computed attributes.
    pub attributes: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingOperation {
    remaining_polls: u32,
    physical_id: Option<String>,
    attributes: Properties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct World {
    #[serde(default)]
    resources: BTreeMap<String, SandboxResource>,
    #[serde(default)]
    operations: BTreeMap<String, PendingOperation>,
}

/// Simulated cloud provider.
#[derive(Debug)]
pub struct SandboxProvider {
    config: SandboxConfig,
    pseudo: PseudoParameters,
    path: Option<PathBuf>,
    world: Mutex<World>,
}

impl SandboxProvider {
    /// Creates a sandbox that lives only in memory.
    #[must_use]
    pub fn in_memory(config: SandboxConfig, pseudo: PseudoParameters) -> Self {
        Self {
            config,
            pseudo,
            path: None,
            world: Mutex::new(World::default()),
        }
    }

    /// Opens the sandbox file named in the configuration, starting empty if
    /// it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(config: SandboxConfig, pseudo: PseudoParameters) -> Result<Self, ProviderError> {
        let path = config.file();
        let world = if path.exists() {
            info!("Loading sandbox from: {}", path.display());
            let content = fs::read_to_string(&path).await.map_err(|e| unavailable(&path, &e))?;
            serde_json::from_str(&content).map_err(|e| unavailable(&path, &e))?
        } else {
            debug!("Sandbox file does not exist yet: {}", path.display());
            World::default()
        };

        Ok(Self {
            config,
            pseudo,
            path: Some(path),
            world: Mutex::new(world),
        })
    }

    /// Returns a copy of every simulated resource, keyed by physical id.
    pub async fn resources(&self) -> BTreeMap<String, SandboxResource> {
        self.world.lock().await.resources.clone()
    }

    async fn persist(&self, world: &World) -> Result<(), ProviderError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(|e| unavailable(path, &e))?;
        }

        let content = serde_json::to_string_pretty(world).map_err(|e| unavailable(path, &e))?;
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| unavailable(path, &e))?;
        file.write_all(content.as_bytes()).await.map_err(|e| unavailable(path, &e))?;
        file.sync_all().await.map_err(|e| unavailable(path, &e))?;
        fs::rename(&temp_path, path).await.map_err(|e| unavailable(path, &e))?;
        Ok(())
    }

    /// Computes attributes: the properties, an `Arn`, and configured
    /// templated attributes.
    fn attributes(&self, resource_type: &str, logical_name: &str, id: &str, properties: &Properties) -> Properties {
        let mut attributes = properties.clone();

        let mut segments = resource_type.split("::").skip(1);
        let service = segments.next().unwrap_or("sandbox").to_lowercase();
        let kind = segments.next().unwrap_or("resource").to_lowercase();
        attributes.insert(
            String::from("Arn"),
            Value::string(format!(
                "arn:{}:{}:{}:{}:{}/{}",
                self.pseudo.partition, service, self.pseudo.region, self.pseudo.account_id, kind, id
            )),
        );

        for (name, template) in &self.config.type_config(resource_type).attributes {
            let rendered = template
                .replace("{id}", id)
                .replace("{name}", logical_name)
                .replace("{region}", &self.pseudo.region)
                .replace("{account}", &self.pseudo.account_id)
                .replace("{partition}", &self.pseudo.partition);
            attributes.insert(name.clone(), Value::string(rendered));
        }

        attributes
    }

    /// Answers immediately or parks the result behind simulated polls.
    fn respond(
        &self,
        world: &mut World,
        resource_type: &str,
        physical_id: Option<String>,
        attributes: Properties,
    ) -> ProviderResponse {
        let polls = self.config.type_config(resource_type).pending_polls;
        if polls == 0 {
            return ProviderResponse::Done(ProviderOutput { physical_id, attributes });
        }

        let operation_id = format!("op-{}", Uuid::new_v4().simple());
        world.operations.insert(
            operation_id.clone(),
            PendingOperation {
                remaining_polls: polls,
                physical_id,
                attributes,
            },
        );
        ProviderResponse::InProgress { operation_id }
    }
}

#[async_trait]
impl ResourceProvider for SandboxProvider {
    async fn describe_schema(&self, resource_type: &str) -> Result<ProviderSchema, ProviderError> {
        Ok(self.config.type_config(resource_type).schema.to_schema())
    }

    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        properties: &Properties,
    ) -> Result<ProviderResponse, ProviderError> {
        let kind = resource_type
            .rsplit("::")
            .next()
            .unwrap_or("resource")
            .to_lowercase();
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("{kind}-{}", &simple[..12]);
        let attributes = self.attributes(resource_type, logical_name, &id, properties);

        let mut world = self.world.lock().await;
        world.resources.insert(
            id.clone(),
            SandboxResource {
                resource_type: resource_type.to_string(),
                logical_name: logical_name.to_string(),
                properties: properties.clone(),
                attributes: attributes.clone(),
            },
        );
        let response = self.respond(&mut world, resource_type, Some(id.clone()), attributes);
        self.persist(&world).await?;

        info!("Sandbox created {} ({})", id, resource_type);
        Ok(response)
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        _previous: &Properties,
        properties: &Properties,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut world = self.world.lock().await;
        let logical_name = world
            .resources
            .get(physical_id)
            .map(|r| r.logical_name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            })?;

        let attributes = self.attributes(resource_type, &logical_name, physical_id, properties);
        if let Some(resource) = world.resources.get_mut(physical_id) {
            resource.properties = properties.clone();
            resource.attributes = attributes.clone();
        }
        let response = self.respond(&mut world, resource_type, Some(physical_id.to_string()), attributes);
        self.persist(&world).await?;

        info!("Sandbox updated {}", physical_id);
        Ok(response)
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> Result<ProviderResponse, ProviderError> {
        let mut world = self.world.lock().await;
        if world.resources.remove(physical_id).is_none() {
            return Err(ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            });
        }
        let response = self.respond(&mut world, resource_type, None, Properties::new());
        self.persist(&world).await?;

        info!("Sandbox deleted {}", physical_id);
        Ok(response)
    }

    async fn poll(&self, resource_type: &str, operation_id: &str) -> Result<PollStatus, ProviderError> {
        let mut world = self.world.lock().await;
        let Some(pending) = world.operations.get_mut(operation_id) else {
            return Ok(PollStatus::Failed(format!("unknown operation {operation_id}")));
        };

        if pending.remaining_polls > 1 {
            pending.remaining_polls -= 1;
            debug!("Sandbox operation {} ({}) still pending", operation_id, resource_type);
            self.persist(&world).await?;
            return Ok(PollStatus::InProgress);
        }

        let done = world.operations.remove(operation_id);
        self.persist(&world).await?;
        Ok(done.map_or_else(
            || PollStatus::Failed(format!("unknown operation {operation_id}")),
            |op| {
                PollStatus::Done(ProviderOutput {
                    physical_id: op.physical_id,
                    attributes: op.attributes,
                })
            },
        ))
    }
}

fn unavailable(path: &Path, e: &dyn std::fmt::Display) -> ProviderError {
    ProviderError::Unavailable {
        message: format!("sandbox file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxTypeConfig;
    use tempfile::TempDir;

    fn config(path: &Path, polls: u32) -> SandboxConfig {
        let mut types = BTreeMap::new();
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("DNSName"), String::from("{name}.{region}.elb.example.com"));
        types.insert(
            String::from("AWS::ElasticLoadBalancingV2::LoadBalancer"),
            SandboxTypeConfig {
                attributes,
                pending_polls: polls,
                ..SandboxTypeConfig::default()
            },
        );
        SandboxConfig {
            path: path.display().to_string(),
            types,
            ..SandboxConfig::default()
        }
    }

    fn props() -> Properties {
        let mut props = Properties::new();
        props.insert(String::from("Scheme"), Value::string("internet-facing"));
        props
    }

    #[tokio::test]
    async fn test_create_computes_attributes_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sandbox.json");
        let provider = SandboxProvider::open(config(&path, 0), PseudoParameters::default())
            .await
            .unwrap();

        let response = provider
            .create("AWS::ElasticLoadBalancingV2::LoadBalancer", "Lb", &props())
            .await
            .unwrap();
        let ProviderResponse::Done(output) = response else {
            panic!("expected a synchronous create");
        };
        let id = output.physical_id.unwrap();
        assert!(id.starts_with("loadbalancer-"));
        assert_eq!(
            output.attributes["DNSName"],
            Value::string("Lb.us-east-1.elb.example.com")
        );
        assert_eq!(output.attributes["Scheme"], Value::string("internet-facing"));
        assert!(output.attributes["Arn"].as_str().unwrap().contains(":elasticloadbalancingv2:"));

        let reopened = SandboxProvider::open(config(&path, 0), PseudoParameters::default())
            .await
            .unwrap();
        assert!(reopened.resources().await.contains_key(&id));
    }

    #[tokio::test]
    async fn test_pending_operations_complete_after_polls() {
        let dir = TempDir::new().unwrap();
        let provider = SandboxProvider::in_memory(config(&dir.path().join("s.json"), 2), PseudoParameters::default());

        let ProviderResponse::InProgress { operation_id } = provider
            .create("AWS::ElasticLoadBalancingV2::LoadBalancer", "Lb", &props())
            .await
            .unwrap()
        else {
            panic!("expected a pending create");
        };

        let first = provider.poll("AWS::ElasticLoadBalancingV2::LoadBalancer", &operation_id).await.unwrap();
        assert_eq!(first, PollStatus::InProgress);
        let second = provider.poll("AWS::ElasticLoadBalancingV2::LoadBalancer", &operation_id).await.unwrap();
        assert!(matches!(second, PollStatus::Done(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_resource() {
        let provider = SandboxProvider::in_memory(SandboxConfig::default(), PseudoParameters::default());
        let err = provider
            .update("AWS::S3::Bucket", "bucket-0", &Properties::new(), &props())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));

        let err = provider.delete("AWS::S3::Bucket", "bucket-0").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }
}
