//! Domain event system: decoupled observation of flow execution.
//!
//! The engine publishes lifecycle events here; the gateway log stream and
//! anything else interested subscribes. Events never carry hidden Step fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::instance::FlowStatus;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A submission started driving an instance
    InstanceStarted {
        instance_id: String,
        definition_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A node finished and its Step was appended
    NodeExecuted {
        instance_id: String,
        node_id: String,
        decision: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed by an inner agent
    ToolExecuted {
        instance_id: String,
        tool_name: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// A submission reached a terminal status
    InstanceFinished {
        instance_id: String,
        status: FlowStatus,
        steps: usize,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InstanceStarted { .. } => "instance_started",
            Self::NodeExecuted { .. } => "node_executed",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::InstanceFinished { .. } => "instance_finished",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::NodeExecuted {
            instance_id: "i1".into(),
            node_id: "input_superego".into(),
            decision: "ACCEPT".into(),
            duration_ms: 12,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::NodeExecuted { node_id, decision, .. } => {
                assert_eq!(node_id, "input_superego");
                assert_eq!(decision, "ACCEPT");
            }
            _ => panic!("Expected NodeExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = DomainEvent::InstanceFinished {
            instance_id: "i1".into(),
            status: FlowStatus::Blocked,
            steps: 2,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "instance_finished");
        assert_eq!(json["status"], "blocked");
    }
}
