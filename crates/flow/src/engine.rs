//! Flow engine: walks a flow definition for one submission.
//!
//! Each submission runs in its own task:
//!
//! 1. a user Step is appended with the raw text as its `response`;
//! 2. the current node's iteration counter is incremented and checked;
//! 3. the node's runner executes on the previous Step's response and guidance;
//! 4. the resulting Step is appended and the decision resolved to a target;
//! 5. `end` stops the walk, anything else loops.
//!
//! Structural failures (unmatched decision, exhausted cap, failed node,
//! timeout) end the instance with `status = error`. Cancellation and `BLOCK`
//! end it with their own statuses. Steps already appended are never removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use superego_core::error::{Error, FlowError};
use superego_core::event::{DomainEvent, EventBus};
use superego_core::flow::FlowDefinition;
use superego_core::instance::{FlowInstance, FlowStatus};
use superego_core::step::Step;
use superego_core::store::FlowStore;

use crate::audit::{AuditEntry, AuditSink};
use crate::multiplexer::StreamMultiplexer;
use crate::node::{NodeContext, NodeRegistry};
use crate::stream_event::FlowStreamEvent;

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Drives flow instances. Cheap to clone; clones share running instances.
#[derive(Clone)]
pub struct FlowEngine {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn FlowStore>,
    events: Arc<EventBus>,
    audit: Option<Arc<dyn AuditSink>>,
    timeout: Option<Duration>,
    event_buffer: usize,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl FlowEngine {
    pub fn new(registry: NodeRegistry, store: Arc<dyn FlowStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            events: Arc::new(EventBus::default()),
            audit: None,
            timeout: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Internal collaborator that receives every Step unredacted.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Wall-clock limit on one submission; `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.running().contains_key(instance_id)
    }

    /// Ids of the instances currently being driven.
    pub fn running_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request cancellation of a running instance. Returns false if it is not running.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self.running().get(instance_id) {
            Some(token) => {
                info!(instance_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Submit user input to a flow.
    ///
    /// Without `instance_id` a new instance is created. With one, the input
    /// continues that instance: a new user Step is appended to its record and
    /// the walk re-enters at the start node with fresh iteration counters.
    pub async fn submit(
        &self,
        definition_id: &str,
        text: &str,
        instance_id: Option<&str>,
    ) -> Result<FlowRun, Error> {
        let definition = self.store.load_flow_definition(definition_id).await?;
        definition.validate()?;

        let mut instance = match instance_id {
            Some(id) => {
                let existing = self.store.load_instance(id).await?;
                if existing.definition_id != definition.id {
                    return Err(FlowError::InvalidDefinition {
                        flow: definition.id.clone(),
                        reason: format!(
                            "instance '{id}' belongs to flow '{}'",
                            existing.definition_id
                        ),
                    }
                    .into());
                }
                existing
            }
            None => FlowInstance::new(&definition.id),
        };

        let cancel = CancellationToken::new();
        {
            let mut running = self.running();
            if running.contains_key(&instance.id) {
                return Err(FlowError::InstanceBusy(instance.id.clone()).into());
            }
            running.insert(instance.id.clone(), cancel.clone());
        }

        instance.iterations.clear();
        instance.status = FlowStatus::Running;
        instance.error = None;
        instance.current_node = Some(definition.start.clone());
        instance.touch();
        if let Err(e) = self.store.save_instance(&instance).await {
            self.running().remove(&instance.id);
            return Err(e.into());
        }

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let run_id = instance.id.clone();
        let engine = self.clone();
        let text = text.to_string();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { engine.drive(definition, instance, text, tx, token).await });

        Ok(FlowRun {
            instance_id: run_id,
            events: rx,
            cancel,
            handle,
        })
    }

    async fn drive(
        self,
        definition: FlowDefinition,
        mut instance: FlowInstance,
        text: String,
        tx: mpsc::Sender<FlowStreamEvent>,
        cancel: CancellationToken,
    ) -> FlowInstance {
        let mux = StreamMultiplexer::new(tx, &instance.id);
        info!(instance_id = %instance.id, flow = %definition.id, "Flow instance started");
        self.events.publish(DomainEvent::InstanceStarted {
            instance_id: instance.id.clone(),
            definition_id: definition.id.clone(),
            timestamp: Utc::now(),
        });

        let walk = self.walk(&definition, &mut instance, &text, &mux, &cancel);
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, walk).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FlowError::Timeout(limit.as_secs())),
            },
            None => walk.await,
        };

        match outcome {
            Ok(status) => {
                instance.status = status;
                if status != FlowStatus::Cancelled {
                    instance.current_node = None;
                }
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Flow instance ended with error");
                self.events.publish(DomainEvent::ErrorOccurred {
                    context: format!("instance {}", instance.id),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                instance.status = FlowStatus::Error;
                instance.error = Some(e.to_string());
            }
        }
        instance.touch();

        if let Err(e) = self.store.save_instance(&instance).await {
            warn!(instance_id = %instance.id, error = %e, "Failed to save final instance state");
        }
        self.running().remove(&instance.id);

        info!(
            instance_id = %instance.id,
            status = %instance.status,
            steps = instance.record.len(),
            "Flow instance finished"
        );
        self.events.publish(DomainEvent::InstanceFinished {
            instance_id: instance.id.clone(),
            status: instance.status,
            steps: instance.record.len(),
            timestamp: Utc::now(),
        });
        mux.finish(&instance).await;
        instance
    }

    async fn walk(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        text: &str,
        mux: &StreamMultiplexer,
        cancel: &CancellationToken,
    ) -> Result<FlowStatus, FlowError> {
        self.record_step(instance, Step::user(text, &definition.start), mux)
            .await?;
        let mut current = definition.start.clone();

        loop {
            if cancel.is_cancelled() {
                info!(instance_id = %instance.id, node = %current, "Cancelled before node execution");
                return Ok(FlowStatus::Cancelled);
            }
            instance.current_node = Some(current.clone());

            let node = definition.node(&current).ok_or_else(|| FlowError::UnknownNode {
                flow: definition.id.clone(),
                node: current.clone(),
            })?;
            let agent_id = definition.agent_id(&current).to_string();
            let max_iterations = node.max_iterations();

            let count = {
                let counter = instance.iterations.entry(current.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            if count > max_iterations {
                let err = FlowError::IterationLimitExceeded {
                    node: current.clone(),
                    max_iterations,
                };
                warn!(
                    instance_id = %instance.id,
                    node = %current,
                    max_iterations,
                    "Iteration limit reached, ending flow"
                );
                let mut step = Step::system(
                    &agent_id,
                    format!("Stopped: '{current}' reached its limit of {max_iterations} executions."),
                );
                step.agent_guidance = Some(err.to_string());
                self.record_step(instance, step, mux).await?;
                return Err(err);
            }

            let previous = instance.record.last();
            let input = previous.map(|s| s.response.clone()).unwrap_or_default();
            let guidance = previous.and_then(|s| s.agent_guidance.clone());
            let runner = self.registry.get(node.kind())?;

            let ctx = NodeContext {
                instance_id: instance.id.clone(),
                node_id: current.clone(),
                agent_id: agent_id.clone(),
                node: node.clone(),
                input: input.clone(),
                guidance,
                round_budget: max_iterations - count + 1,
            };
            debug!(instance_id = %instance.id, node = %current, iteration = count, "Executing node");

            let started = Instant::now();
            let partials = mux.partials(&agent_id);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(instance_id = %instance.id, node = %current, "Cancelled during node execution");
                    return Ok(FlowStatus::Cancelled);
                }
                result = runner.run(ctx, &partials) => result,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    let mut step = Step::system(
                        &agent_id,
                        format!("'{current}' could not complete this step."),
                    );
                    step.input = Some(input);
                    step.agent_guidance = Some(e.to_string());
                    self.record_step(instance, step, mux).await?;
                    return Err(e);
                }
            };

            if output.extra_rounds > 0
                && let Some(counter) = instance.iterations.get_mut(&current)
            {
                *counter += output.extra_rounds;
            }

            let decision = output.decision.clone();
            let mut step = output.into_step(&agent_id, &input);
            let resolved = node.resolve(&current, &decision);
            step.next_agent = match &resolved {
                Ok(target) => target.next_node(&current).map(str::to_string),
                Err(_) => None,
            };
            let next = step.next_agent.clone();
            let tool_results: Vec<(String, bool)> = step
                .tool_usage
                .iter()
                .map(|u| (u.tool_name.clone(), !u.is_error()))
                .collect();

            self.record_step(instance, step, mux).await?;
            self.events.publish(DomainEvent::NodeExecuted {
                instance_id: instance.id.clone(),
                node_id: current.clone(),
                decision: decision.to_string(),
                duration_ms,
                timestamp: Utc::now(),
            });
            for (tool_name, success) in tool_results {
                self.events.publish(DomainEvent::ToolExecuted {
                    instance_id: instance.id.clone(),
                    tool_name,
                    success,
                    timestamp: Utc::now(),
                });
            }

            if let Err(e) = resolved {
                warn!(
                    instance_id = %instance.id,
                    node = %current,
                    decision = %decision,
                    "No transition for decision"
                );
                return Err(e);
            }

            match next {
                Some(next) => {
                    debug!(
                        instance_id = %instance.id,
                        from = %current,
                        to = %next,
                        decision = %decision,
                        "Transition"
                    );
                    current = next;
                }
                None if decision.is_block() => return Ok(FlowStatus::Blocked),
                None => return Ok(FlowStatus::Completed),
            }
        }
    }

    /// Persist, audit and forward one Step, then add it to the record.
    async fn record_step(
        &self,
        instance: &mut FlowInstance,
        step: Step,
        mux: &StreamMultiplexer,
    ) -> Result<(), FlowError> {
        self.store
            .append_step(&instance.id, &step.export(self.store.export_scope()))
            .await?;
        if let Some(audit) = &self.audit {
            audit.record(&AuditEntry::new(&instance.id, step.clone()));
        }
        mux.complete_step(&step).await;
        instance.record.push(step);
        instance.touch();
        Ok(())
    }
}

/// A submission in progress.
pub struct FlowRun {
    pub instance_id: String,
    /// Partial output, completed Steps and one terminal event
    pub events: mpsc::Receiver<FlowStreamEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<FlowInstance>,
}

impl FlowRun {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Split into the event stream and the task that yields the final instance.
    ///
    /// The instance carries unredacted Steps; use `public_view()` before
    /// handing it to a user.
    pub fn into_parts(self) -> (mpsc::Receiver<FlowStreamEvent>, JoinHandle<FlowInstance>) {
        (self.events, self.handle)
    }

    /// Drain every event and wait for the final instance.
    pub async fn collect(mut self) -> Result<(Vec<FlowStreamEvent>, FlowInstance), Error> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let instance = self
            .handle
            .await
            .map_err(|e| Error::Internal(format!("flow task failed: {e}")))?;
        Ok((events, instance))
    }
}
