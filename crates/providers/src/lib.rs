//! LLM provider implementations for Superego.
//!
//! All providers implement `superego_core::Provider`. The router picks one
//! per node from the node's model string and the configuration.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::{ProviderRouter, build_from_config};
