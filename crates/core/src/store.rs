//! FlowStore trait: the persistence collaborator.
//!
//! The engine never assumes a format. It saves instance headers (status,
//! current node, counters) and appends Steps one at a time; it never asks a
//! store to rewrite a Step.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::flow::FlowDefinition;
use crate::instance::FlowInstance;
use crate::step::{ExportScope, Step};

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// The backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// What the engine may hand this store. Public unless the store is an
    /// internal collaborator that should keep hidden fields.
    fn export_scope(&self) -> ExportScope {
        ExportScope::Public
    }

    async fn load_flow_definition(&self, id: &str) -> Result<FlowDefinition, StoreError>;

    async fn list_flow_definitions(&self) -> Result<Vec<FlowDefinition>, StoreError>;

    async fn save_flow_definition(&self, definition: &FlowDefinition) -> Result<(), StoreError>;

    /// Persist the instance header. The record inside `instance` is ignored.
    async fn save_instance(&self, instance: &FlowInstance) -> Result<(), StoreError>;

    /// Append one Step to an instance's record.
    async fn append_step(&self, instance_id: &str, step: &Step) -> Result<(), StoreError>;

    /// Load an instance together with its full record.
    async fn load_instance(&self, id: &str) -> Result<FlowInstance, StoreError>;

    /// All instance headers, newest first. Records are left empty.
    async fn list_instances(&self) -> Result<Vec<FlowInstance>, StoreError>;
}
