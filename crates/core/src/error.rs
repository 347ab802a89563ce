//! Error types for the Superego domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Only structural failures surface as errors. Recoverable node-level
//! conditions (an unparseable decision, a failing tool) are absorbed by the
//! node and recorded as a Step with a diagnostic decision instead.

use thiserror::Error;

/// The top-level error type for all Superego operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Flow orchestration errors ---
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool not available to node: {tool_name} ({reason})")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Flow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Flow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted record in {location}: {reason}")]
    Corrupted { location: String, reason: String },
}

/// Structural failures of the orchestration engine.
///
/// Any of these ends the affected instance with `status = error`.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("Invalid flow definition '{flow}': {reason}")]
    InvalidDefinition { flow: String, reason: String },

    #[error("Node '{node}' is not defined in flow '{flow}'")]
    UnknownNode { flow: String, node: String },

    #[error("No runner registered for node kind '{0}'")]
    MissingRunner(String),

    #[error("Node '{node}' produced decision '{decision}' with no transition entry")]
    UnmatchedDecision { node: String, decision: String },

    #[error("Node '{node}' returned a {returned} decision but is configured as {expected}")]
    DecisionKindMismatch {
        node: String,
        expected: String,
        returned: String,
    },

    #[error("Node '{node}' exceeded its iteration limit of {max_iterations}")]
    IterationLimitExceeded { node: String, max_iterations: u32 },

    #[error("Node '{node}' failed: {reason}")]
    NodeFailed { node: String, reason: String },

    #[error("Flow instance '{0}' is already running")]
    InstanceBusy(String),

    #[error("Flow instance timed out after {0}s")]
    Timeout(u64),

    #[error("Could not persist flow state: {0}")]
    Persistence(String),
}

impl From<StoreError> for FlowError {
    fn from(e: StoreError) -> Self {
        FlowError::Persistence(e.to_string())
    }
}
