//! Streaming multiplexer: the only path from a running instance to the user.
//!
//! All events of one instance are sent from the single task that drives it,
//! so a node's partials always precede its `complete_step`, which precedes
//! the next node's first partial. A dropped receiver never stops the
//! instance: sends to a closed channel are ignored.

use superego_core::instance::{FlowInstance, FlowStatus};
use superego_core::step::{PublicStep, Step};
use tokio::sync::mpsc;

use crate::stream_event::FlowStreamEvent;

pub struct StreamMultiplexer {
    tx: mpsc::Sender<FlowStreamEvent>,
    instance_id: String,
}

impl StreamMultiplexer {
    pub fn new(tx: mpsc::Sender<FlowStreamEvent>, instance_id: impl Into<String>) -> Self {
        Self {
            tx,
            instance_id: instance_id.into(),
        }
    }

    /// Sender for one node's partial output.
    pub fn partials(&self, agent_id: impl Into<String>) -> PartialSender {
        PartialSender {
            tx: Some(self.tx.clone()),
            instance_id: self.instance_id.clone(),
            agent_id: agent_id.into(),
        }
    }

    /// Forward an appended Step, redacted.
    pub async fn complete_step(&self, step: &Step) {
        self.send(FlowStreamEvent::CompleteStep {
            instance_id: self.instance_id.clone(),
            step: PublicStep::from(step),
        })
        .await;
    }

    /// Emit the terminal event for a finished instance and close the stream.
    pub async fn finish(self, instance: &FlowInstance) {
        let record = instance.record.public();
        let event = match instance.status {
            FlowStatus::Error => FlowStreamEvent::Error {
                instance_id: self.instance_id.clone(),
                message: instance
                    .error
                    .clone()
                    .unwrap_or_else(|| "flow ended with an error".into()),
                status: instance.status,
                record,
            },
            status => FlowStreamEvent::Done {
                instance_id: self.instance_id.clone(),
                status,
                error: instance.error.clone(),
                record,
            },
        };
        self.send(event).await;
    }

    async fn send(&self, event: FlowStreamEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Partial-output handle given to a node runner.
pub struct PartialSender {
    tx: Option<mpsc::Sender<FlowStreamEvent>>,
    instance_id: String,
    agent_id: String,
}

impl PartialSender {
    /// A sender that discards everything (for running nodes outside an engine).
    pub fn disconnected(agent_id: impl Into<String>) -> Self {
        Self {
            tx: None,
            instance_id: String::new(),
            agent_id: agent_id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn send(&self, content: impl Into<String>) {
        let content = content.into();
        if content.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx
                .send(FlowStreamEvent::PartialOutput {
                    instance_id: self.instance_id.clone(),
                    agent_id: self.agent_id.clone(),
                    content,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_keep_send_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let mux = StreamMultiplexer::new(tx, "i-1");

        let partials = mux.partials("evaluator");
        partials.send("Looks ").await;
        partials.send("").await;
        partials.send("fine").await;

        let mut step = Step::assistant("evaluator", "hi");
        step.agent_guidance = Some("hidden".into());
        mux.complete_step(&step).await;

        let mut instance = FlowInstance::new("calc");
        instance.status = FlowStatus::Completed;
        instance.record.push(step);
        mux.finish(&instance).await;

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds, vec!["partial_output", "partial_output", "complete_step", "done"]);
    }

    #[tokio::test]
    async fn error_status_ends_with_error_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let mux = StreamMultiplexer::new(tx, "i-2");

        let mut instance = FlowInstance::new("calc");
        instance.status = FlowStatus::Error;
        instance.error = Some("Node 'calculator' produced decision 'ERROR'".into());
        mux.finish(&instance).await;

        match rx.recv().await {
            Some(FlowStreamEvent::Error { message, status, .. }) => {
                assert!(message.contains("ERROR"));
                assert_eq!(status, FlowStatus::Error);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mux = StreamMultiplexer::new(tx, "i-3");
        mux.partials("a").send("text").await;
        mux.complete_step(&Step::user("hi", "start")).await;
    }
}
