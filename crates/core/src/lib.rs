//! # Superego Core
//!
//! Domain types, traits, and error definitions for the Superego flow runtime.
//! This crate has **no framework dependencies**: it defines the data model
//! (Steps, records, flow definitions, instances, decisions) and the
//! collaborator traits (Provider, Tool, FlowStore) every other crate builds on.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;
pub mod decision;
pub mod flow;
pub mod step;
pub mod instance;
pub mod store;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result, FlowError, ProviderError, StoreError, ToolError};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition};
pub use tool::{Tool, ToolRegistry, ToolResult};
pub use decision::{AgentDecision, Decision, SuperegoDecision};
pub use flow::{
    FlowDefinition, InnerAgentNode, NodeConfig, NodeKind, SuperegoNode, Target, TransitionTable,
};
pub use step::{ExportScope, PublicStep, Step, ToolUsage};
pub use instance::{FlowInstance, FlowRecord, FlowStatus, InstanceView};
pub use store::FlowStore;
pub use event::{DomainEvent, EventBus};
