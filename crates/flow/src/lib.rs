//! # Superego Flow
//!
//! The orchestration engine: walks a flow definition node by node, runs the
//! constitution evaluator and inner agent executors, applies transitions and
//! iteration caps, and streams redacted output to the caller.
//!
//! ```text
//! submit ─► user Step ─► node ─► decision ─► transition ─► node ─► … ─► end
//!                          │                                  │
//!                          └─ partial_output / complete_step ─┘
//! ```

pub mod audit;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod multiplexer;
pub mod node;
pub mod parse;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use audit::{AuditEntry, AuditLog, AuditSink, TracingAuditSink};
pub use engine::{FlowEngine, FlowRun};
pub use evaluator::ConstitutionEvaluator;
pub use executor::InnerAgentExecutor;
pub use multiplexer::{PartialSender, StreamMultiplexer};
pub use node::{GenerationSettings, NodeContext, NodeOutput, NodeRegistry, NodeRunner};
pub use stream_event::FlowStreamEvent;
