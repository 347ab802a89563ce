//! Persistence collaborators for Superego.
//!
//! Both stores implement `superego_core::FlowStore`. The engine only ever
//! appends Steps and rewrites instance headers; neither store offers a way
//! to edit a Step after the fact.

pub mod file_store;
pub mod in_memory;

pub use file_store::FileFlowStore;
pub use in_memory::InMemoryFlowStore;
