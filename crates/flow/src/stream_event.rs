//! Flow-level streaming events.
//!
//! `FlowStreamEvent` is what crosses the user boundary while an instance
//! runs. Every Step inside an event is a [`PublicStep`], so hidden fields
//! cannot appear here at all.
//!
//! Event kinds:
//! - `partial_output`: a text increment from the node currently running
//! - `complete_step`  - a node finished and its Step was appended
//! - `error`          - the instance ended on a structural failure or timeout
//! - `done`           - the instance ended normally, blocked or cancelled

use serde::{Deserialize, Serialize};
use superego_core::instance::FlowStatus;
use superego_core::step::PublicStep;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowStreamEvent {
    /// Visible text produced by a node while it runs.
    PartialOutput {
        instance_id: String,
        agent_id: String,
        content: String,
    },

    /// A Step was appended to the record.
    CompleteStep { instance_id: String, step: PublicStep },

    /// Terminal: the instance ended with `status = error`.
    Error {
        instance_id: String,
        message: String,
        status: FlowStatus,
        record: Vec<PublicStep>,
    },

    /// Terminal: final record snapshot.
    Done {
        instance_id: String,
        status: FlowStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        record: Vec<PublicStep>,
    },
}

impl FlowStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PartialOutput { .. } => "partial_output",
            Self::CompleteStep { .. } => "complete_step",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    /// Final record carried by a terminal event.
    pub fn record(&self) -> Option<&[PublicStep]> {
        match self {
            Self::Error { record, .. } | Self::Done { record, .. } => Some(record),
            _ => None,
        }
    }
}
