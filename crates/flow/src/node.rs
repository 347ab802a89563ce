//! Node runners: how one node of a flow is executed.
//!
//! The engine looks a runner up by [`NodeKind`] in a [`NodeRegistry`] it is
//! given at construction. A runner turns a [`NodeContext`] into a
//! [`NodeOutput`]; the engine alone turns that into a Step and a transition.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use superego_core::decision::Decision;
use superego_core::error::{FlowError, ProviderError};
use superego_core::flow::{NodeConfig, NodeKind};
use superego_core::message::MessageToolCall;
use superego_core::provider::{Provider, ProviderRequest};
use superego_core::step::{Step, ToolUsage};
use superego_core::tool::ToolRegistry;
use superego_providers::ProviderRouter;

use crate::evaluator::ConstitutionEvaluator;
use crate::executor::InnerAgentExecutor;
use crate::multiplexer::PartialSender;
use crate::parse::VisibleTextFilter;

/// Everything a runner needs for one execution.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub instance_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub node: NodeConfig,
    /// The previous Step's `response`
    pub input: String,
    /// The previous Step's `agent_guidance`
    pub guidance: Option<String>,
    /// Generation rounds this execution may start (at least 1)
    pub round_budget: u32,
}

impl NodeContext {
    pub(crate) fn failed(&self, reason: impl std::fmt::Display) -> FlowError {
        FlowError::NodeFailed {
            node: self.node_id.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn wrong_kind(&self, expected: NodeKind) -> FlowError {
        self.failed(format!(
            "{expected} runner was given a {} node",
            self.node.kind()
        ))
    }
}

/// The terminal record of one node execution.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub decision: Decision,
    pub thinking: Option<String>,
    pub agent_guidance: Option<String>,
    pub response: String,
    pub tool_usage: Vec<ToolUsage>,
    pub constitution_text_used: Option<String>,
    pub system_prompt_used: Option<String>,
    /// Generation rounds started beyond the first
    pub extra_rounds: u32,
}

impl NodeOutput {
    /// The Step this output is recorded as. `next_agent` is left for the engine.
    pub fn into_step(self, agent_id: &str, input: &str) -> Step {
        let mut step = Step::assistant(agent_id, input);
        step.decision = Some(self.decision);
        step.thinking = self.thinking;
        step.agent_guidance = self.agent_guidance;
        step.response = self.response;
        step.tool_usage = self.tool_usage;
        step.constitution_text_used = self.constitution_text_used;
        step.system_prompt_used = self.system_prompt_used;
        step
    }
}

/// Executes nodes of one kind.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Run one node, forwarding visible text through `partials` as it arrives.
    ///
    /// Recoverable conditions (bad decisions, failing tools) are reported in
    /// the output. `Err` is reserved for failures that end the instance.
    async fn run(
        &self,
        ctx: NodeContext,
        partials: &PartialSender,
    ) -> Result<NodeOutput, FlowError>;
}

/// Explicit kind → runner mapping handed to the engine.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    runners: HashMap<NodeKind, Arc<dyn NodeRunner>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluator and executor backed by LLM providers.
    pub fn standard(
        router: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
        settings: GenerationSettings,
    ) -> Self {
        Self::new()
            .with(Arc::new(ConstitutionEvaluator::new(router.clone(), settings.clone())))
            .with(Arc::new(InnerAgentExecutor::new(router, tools, settings)))
    }

    pub fn with(mut self, runner: Arc<dyn NodeRunner>) -> Self {
        self.register(runner);
        self
    }

    /// Register a runner. Replaces any existing runner for the same kind.
    pub fn register(&mut self, runner: Arc<dyn NodeRunner>) {
        self.runners.insert(runner.kind(), runner);
    }

    pub fn get(&self, kind: NodeKind) -> Result<Arc<dyn NodeRunner>, FlowError> {
        self.runners
            .get(&kind)
            .cloned()
            .ok_or_else(|| FlowError::MissingRunner(kind.to_string()))
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

/// Model parameters shared by LLM-backed runners.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            default_model: "anthropic/claude-sonnet-4".into(),
            temperature: 0.7,
            max_tokens: Some(4096),
        }
    }
}

impl GenerationSettings {
    /// Provider and model name for a node, honouring its model override.
    pub(crate) fn resolve(
        &self,
        router: &ProviderRouter,
        node: &NodeContext,
    ) -> Result<(Arc<dyn Provider>, String), FlowError> {
        let model = node.node.model().unwrap_or(self.default_model.as_str());
        router.resolve(model).map_err(|e| {
            error!(node = %node.node_id, model = %model, error = %e, "No provider for node");
            node.failed(e)
        })
    }
}

/// Stream one generation, forwarding visible text as partial output.
///
/// Returns the full text and the tool calls, with deltas merged by call id.
pub(crate) async fn stream_generation(
    provider: &dyn Provider,
    request: ProviderRequest,
    partials: &PartialSender,
) -> Result<(String, Vec<MessageToolCall>), ProviderError> {
    let mut rx = provider.stream(request).await?;
    let mut filter = VisibleTextFilter::new();
    let mut full_content = String::new();
    let mut tool_calls: Vec<MessageToolCall> = Vec::new();

    while let Some(chunk) = rx.recv().await {
        let chunk = chunk?;

        if let Some(text) = chunk.content.as_deref()
            && !text.is_empty()
        {
            full_content.push_str(text);
            partials.send(filter.push(text)).await;
        }

        for tc in chunk.tool_calls {
            if let Some(existing) = tool_calls.iter_mut().find(|t| t.id == tc.id) {
                existing.arguments.push_str(&tc.arguments);
            } else {
                tool_calls.push(tc);
            }
        }

        if chunk.done {
            break;
        }
    }

    partials.send(filter.finish()).await;
    Ok((full_content, tool_calls))
}
