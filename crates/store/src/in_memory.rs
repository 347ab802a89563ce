//! In-memory store: used by tests and by `storage.backend = "memory"`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use superego_core::error::StoreError;
use superego_core::flow::FlowDefinition;
use superego_core::instance::FlowInstance;
use superego_core::step::{ExportScope, Step};
use superego_core::store::FlowStore;
use tokio::sync::RwLock;

pub struct InMemoryFlowStore {
    definitions: Arc<RwLock<HashMap<String, FlowDefinition>>>,
    instances: Arc<RwLock<HashMap<String, FlowInstance>>>,
    scope: ExportScope,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            scope: ExportScope::Public,
        }
    }

    /// Keep hidden Step fields (for stores that back an audit view).
    pub fn internal() -> Self {
        Self {
            scope: ExportScope::Internal,
            ..Self::new()
        }
    }

    /// Seed the store with definitions.
    pub fn with_definitions(definitions: impl IntoIterator<Item = FlowDefinition>) -> Self {
        let map = definitions
            .into_iter()
            .map(|def| (def.id.clone(), def))
            .collect();
        Self {
            definitions: Arc::new(RwLock::new(map)),
            ..Self::new()
        }
    }
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn export_scope(&self) -> ExportScope {
        self.scope
    }

    async fn load_flow_definition(&self, id: &str) -> Result<FlowDefinition, StoreError> {
        self.definitions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(id.to_string()))
    }

    async fn list_flow_definitions(&self) -> Result<Vec<FlowDefinition>, StoreError> {
        let mut defs: Vec<FlowDefinition> =
            self.definitions.read().await.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn save_flow_definition(&self, definition: &FlowDefinition) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn save_instance(&self, instance: &FlowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance.id) {
            Some(existing) => {
                let record = std::mem::take(&mut existing.record);
                *existing = FlowInstance {
                    record,
                    ..instance.clone()
                };
            }
            None => {
                instances.insert(instance.id.clone(), instance.header());
            }
        }
        Ok(())
    }

    async fn append_step(&self, instance_id: &str, step: &Step) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;
        instance.record.push(step.clone());
        Ok(())
    }

    async fn load_instance(&self, id: &str) -> Result<FlowInstance, StoreError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::InstanceNotFound(id.to_string()))
    }

    async fn list_instances(&self) -> Result<Vec<FlowInstance>, StoreError> {
        let mut headers: Vec<FlowInstance> = self
            .instances
            .read()
            .await
            .values()
            .map(FlowInstance::header)
            .collect();
        headers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(headers)
    }
}
