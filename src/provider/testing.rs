//! Scripted in-memory provider for engine tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ProviderError;
use crate::template::{Properties, Value};

use super::{FieldPolicy, PollStatus, ProviderOutput, ProviderResponse, ProviderSchema, ResourceProvider};

#[derive(Debug, Clone)]
pub struct Stored {
    pub logical_name: String,
    pub properties: Properties,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u32,
    resources: BTreeMap<String, Stored>,
    calls: Vec<String>,
    failures: HashMap<(String, String), u32>,
}

/// Provider whose failures are scripted per operation and logical name.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    schemas: BTreeMap<String, ProviderSchema>,
    inner: Mutex<Inner>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, resource_type: &str, schema: ProviderSchema) -> Self {
        self.schemas.insert(resource_type.to_string(), schema);
        self
    }

    /// Makes the next `times` calls of `operation` on `logical_name` fail.
    pub fn fail(&self, operation: &str, logical_name: &str, times: u32) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert((operation.to_string(), logical_name.to_string()), times);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn resources(&self) -> BTreeMap<String, Stored> {
        self.inner.lock().unwrap().resources.clone()
    }

    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources().into_values().map(|r| r.logical_name).collect();
        names.sort();
        names
    }

    fn scripted_failure(inner: &mut Inner, operation: &str, logical_name: &str, resource_type: &str) -> Result<(), ProviderError> {
        let key = (operation.to_string(), logical_name.to_string());
        if let Some(remaining) = inner.failures.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::failed(operation, resource_type, format!("scripted failure of {logical_name}")));
        }
        Ok(())
    }

    fn attributes(physical_id: &str, properties: &Properties) -> Properties {
        let mut attributes = properties.clone();
        attributes.insert(String::from("Arn"), Value::string(format!("arn:test:{physical_id}")));
        attributes
    }
}

#[async_trait]
impl ResourceProvider for ScriptedProvider {
    async fn describe_schema(&self, resource_type: &str) -> Result<ProviderSchema, ProviderError> {
        Ok(self.schemas.get(resource_type).cloned().unwrap_or_else(|| {
            ProviderSchema {
                unlisted: FieldPolicy::Update,
                ..ProviderSchema::default()
            }
            .with_timing(Duration::from_millis(1), Duration::from_secs(5))
        }))
    }

    async fn create(
        &self,
        resource_type: &str,
        logical_name: &str,
        properties: &Properties,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("create {logical_name}"));
        Self::scripted_failure(&mut inner, "create", logical_name, resource_type)?;

        inner.next_id += 1;
        let physical_id = format!("{}-{}", logical_name.to_lowercase(), inner.next_id);
        inner.resources.insert(
            physical_id.clone(),
            Stored {
                logical_name: logical_name.to_string(),
                properties: properties.clone(),
            },
        );
        Ok(ProviderResponse::Done(ProviderOutput {
            attributes: Self::attributes(&physical_id, properties),
            physical_id: Some(physical_id),
        }))
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        _previous: &Properties,
        properties: &Properties,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let logical_name = inner
            .resources
            .get(physical_id)
            .map(|r| r.logical_name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            })?;
        inner.calls.push(format!("update {logical_name}"));
        Self::scripted_failure(&mut inner, "update", &logical_name, resource_type)?;

        if let Some(stored) = inner.resources.get_mut(physical_id) {
            stored.properties = properties.clone();
        }
        Ok(ProviderResponse::Done(ProviderOutput {
            physical_id: Some(physical_id.to_string()),
            attributes: Self::attributes(physical_id, properties),
        }))
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> Result<ProviderResponse, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let logical_name = inner
            .resources
            .get(physical_id)
            .map(|r| r.logical_name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            })?;
        inner.calls.push(format!("delete {logical_name}"));
        Self::scripted_failure(&mut inner, "delete", &logical_name, resource_type)?;

        inner.resources.remove(physical_id);
        Ok(ProviderResponse::Done(ProviderOutput::default()))
    }

    async fn poll(&self, _resource_type: &str, operation_id: &str) -> Result<PollStatus, ProviderError> {
        Err(ProviderError::NotFound {
            physical_id: operation_id.to_string(),
        })
    }
}
