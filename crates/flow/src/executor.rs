//! Inner agent executor.
//!
//! Runs the node's system prompt over its input and lets the model call the
//! tools the node lists. Tool results are folded back into the conversation
//! and generation re-enters, up to the node's remaining round budget.
//!
//! A failing tool ends the execution at once with decision `ERROR` and the
//! failure recorded as `{"error": ...}` in `tool_usage`. The node's
//! transition table decides what happens next.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use superego_core::decision::{AgentDecision, Decision};
use superego_core::error::{FlowError, ToolError};
use superego_core::flow::{InnerAgentNode, NodeConfig, NodeKind};
use superego_core::message::{Message, MessageToolCall};
use superego_core::provider::ProviderRequest;
use superego_core::step::ToolUsage;
use superego_core::tool::{ToolRegistry, ToolResult};
use superego_providers::ProviderRouter;

use crate::evaluator::guidance_message;
use crate::multiplexer::PartialSender;
use crate::node::{GenerationSettings, NodeContext, NodeOutput, NodeRunner, stream_generation};
use crate::parse::{ParsedOutput, parse_agent_output, parse_envelope, with_note};

pub struct InnerAgentExecutor {
    router: Arc<ProviderRouter>,
    tools: Arc<ToolRegistry>,
    settings: GenerationSettings,
}

impl InnerAgentExecutor {
    pub fn new(
        router: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            router,
            tools,
            settings,
        }
    }

    fn system_prompt(node: &InnerAgentNode) -> String {
        let mut decisions: Vec<&str> = node.transitions.iter().map(|(d, _)| d.as_str()).collect();
        if decisions.is_empty() {
            decisions.push(node.fallback_decision.as_str());
        }
        format!(
            "{}\n\n\
             When you are done, answer in this format:\n\
             <thinking>your private reasoning</thinking>\n\
             <decision>one of {}</decision>\n\
             <agent_guidance>notes for the next agent, never shown to the user</agent_guidance>\n\
             <response>what the user sees</response>",
            node.system_prompt.trim(),
            decisions.join(", ")
        )
    }

    /// Invoke one requested tool. Returns the recorded input and the outcome.
    async fn invoke(
        &self,
        node: &InnerAgentNode,
        call: &MessageToolCall,
    ) -> (Value, Result<ToolResult, ToolError>) {
        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let input = match serde_json::from_str::<Value>(raw) {
            Ok(input) => input,
            Err(e) => {
                return (
                    Value::String(call.arguments.clone()),
                    Err(ToolError::InvalidArguments(e.to_string())),
                );
            }
        };

        if !node.tools.iter().any(|t| t == &call.name) {
            return (
                input,
                Err(ToolError::PermissionDenied {
                    tool_name: call.name.clone(),
                    reason: "not listed on this node".into(),
                }),
            );
        }

        let result = self.tools.invoke(&call.name, input.clone()).await;
        (input, result)
    }
}

/// Output of an execution cut short by a diagnostic condition.
fn failed_output(
    text: &str,
    reason: String,
    tool_usage: Vec<ToolUsage>,
    system_prompt: String,
    extra_rounds: u32,
) -> NodeOutput {
    let envelope = parse_envelope(text);
    let response = if envelope.response.is_empty() {
        reason.clone()
    } else {
        envelope.response
    };
    NodeOutput {
        decision: Decision::Agent(AgentDecision::error()),
        thinking: envelope.thinking,
        agent_guidance: with_note(envelope.agent_guidance, Some(reason)),
        response,
        tool_usage,
        constitution_text_used: None,
        system_prompt_used: Some(system_prompt),
        extra_rounds,
    }
}

#[async_trait]
impl NodeRunner for InnerAgentExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::InnerAgent
    }

    async fn run(
        &self,
        ctx: NodeContext,
        partials: &PartialSender,
    ) -> Result<NodeOutput, FlowError> {
        let NodeConfig::InnerAgent(node) = &ctx.node else {
            return Err(ctx.wrong_kind(NodeKind::InnerAgent));
        };

        let definitions = self.tools.definitions_for(&node.tools);
        let system_prompt = Self::system_prompt(node);
        let mut messages = vec![Message::system(&system_prompt)];
        if let Some(guidance) = &ctx.guidance {
            messages.push(guidance_message(guidance));
        }
        messages.push(Message::user(&ctx.input));

        let (provider, model) = self.settings.resolve(&self.router, &ctx)?;
        let budget = ctx.round_budget.max(1);
        let mut tool_usage: Vec<ToolUsage> = Vec::new();
        let mut round = 0u32;

        loop {
            round += 1;
            let request = ProviderRequest {
                model: model.clone(),
                messages: messages.clone(),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
                tools: definitions.clone(),
                stream: true,
            };

            let (text, calls) = stream_generation(provider.as_ref(), request, partials)
                .await
                .map_err(|e| ctx.failed(e))?;

            if calls.is_empty() {
                let ParsedOutput {
                    decision,
                    thinking,
                    agent_guidance,
                    response,
                } = parse_agent_output(&text, &node.fallback_decision);
                debug!(node = %ctx.node_id, decision = %decision, rounds = round, "Executor finished");
                return Ok(NodeOutput {
                    decision: Decision::Agent(decision),
                    thinking,
                    agent_guidance,
                    response,
                    tool_usage,
                    constitution_text_used: None,
                    system_prompt_used: Some(system_prompt),
                    extra_rounds: round - 1,
                });
            }

            if round >= budget {
                warn!(node = %ctx.node_id, rounds = round, "Tool-use budget exhausted");
                let reason =
                    format!("Tool-use budget exhausted after {round} generation round(s).");
                return Ok(failed_output(&text, reason, tool_usage, system_prompt, round - 1));
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let (input, outcome) = self.invoke(node, call).await;
                let (output, failure) = match outcome {
                    Ok(result) if result.success => (result.to_output_value(), None),
                    Ok(result) => (result.to_output_value(), Some(result.output)),
                    Err(e) => (serde_json::json!({ "error": e.to_string() }), Some(e.to_string())),
                };
                tool_usage.push(ToolUsage {
                    tool_name: call.name.clone(),
                    input,
                    output: output.clone(),
                });

                if let Some(reason) = failure {
                    warn!(
                        node = %ctx.node_id,
                        tool = %call.name,
                        error = %reason,
                        "Tool call failed"
                    );
                    let reason = format!("Tool '{}' failed: {reason}", call.name);
                    return Ok(failed_output(&text, reason, tool_usage, system_prompt, round - 1));
                }
                results.push((call.id.clone(), output.to_string()));
            }

            messages.push(Message::assistant_with_tools(&text, calls));
            for (call_id, content) in results {
                messages.push(Message::tool_result(call_id, content));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, make_tool_call};
    use superego_core::flow::{Target, TransitionTable};
    use superego_core::message::Role;

    fn calculator_node(max_iterations: u32) -> InnerAgentNode {
        InnerAgentNode {
            agent_id: None,
            max_iterations,
            model: None,
            system_prompt: "You are a calculator.".into(),
            tools: vec!["calculator".into()],
            fallback_decision: AgentDecision::complete(),
            transitions: TransitionTable::new().with(AgentDecision::complete(), Target::End),
        }
    }

    fn context(node: InnerAgentNode, round_budget: u32) -> NodeContext {
        NodeContext {
            instance_id: "i-1".into(),
            node_id: "calculator".into(),
            agent_id: "calculator".into(),
            node: NodeConfig::InnerAgent(node),
            input: "Calculate 5*10".into(),
            guidance: Some("plain arithmetic".into()),
            round_budget,
        }
    }

    fn executor(provider: ScriptedProvider) -> InnerAgentExecutor {
        InnerAgentExecutor::new(
            Arc::new(ScriptedProvider::router(provider)),
            Arc::new(superego_tools::default_registry()),
            GenerationSettings::default(),
        )
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let provider = ScriptedProvider::new(vec![])
            .then_tool_calls(
                "",
                vec![make_tool_call(
                    "call_1",
                    "calculator",
                    serde_json::json!({"expression": "5*10"}),
                )],
            )
            .then_text("<decision>COMPLETE</decision><response>5 * 10 = 50</response>");
        let requests = provider.requests();

        let output = executor(provider)
            .run(context(calculator_node(3), 3), &PartialSender::disconnected("calculator"))
            .await
            .unwrap();

        assert_eq!(output.decision.as_str(), "COMPLETE");
        assert_eq!(output.response, "5 * 10 = 50");
        assert_eq!(output.extra_rounds, 1);
        assert_eq!(output.tool_usage.len(), 1);
        assert_eq!(output.tool_usage[0].output["result"], "50");
        assert!(output.system_prompt_used.unwrap().starts_with("You are a calculator."));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        assert!(requests[0].messages[1].content.contains("plain arithmetic"));
        let second = &requests[1].messages;
        assert_eq!(second[second.len() - 1].role, Role::Tool);
        assert_eq!(second[second.len() - 1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn tool_error_is_recorded_and_decides_error() {
        let provider = ScriptedProvider::new(vec![]).then_tool_calls(
            "",
            vec![make_tool_call("call_1", "calculator", serde_json::json!({"expression": "1/0"}))],
        );
        let output = executor(provider)
            .run(context(calculator_node(3), 3), &PartialSender::disconnected("calculator"))
            .await
            .unwrap();

        assert_eq!(output.decision, Decision::Agent(AgentDecision::error()));
        assert_eq!(output.tool_usage.len(), 1);
        let error = output.tool_usage[0].output["error"].as_str().unwrap();
        assert!(error.contains("division by zero"));
        assert!(output.response.contains("calculator"));
    }

    #[tokio::test]
    async fn unlisted_tool_is_denied() {
        let mut node = calculator_node(3);
        node.tools.clear();
        let provider = ScriptedProvider::new(vec![]).then_tool_calls(
            "",
            vec![make_tool_call("call_1", "calculator", serde_json::json!({"expression": "1+1"}))],
        );
        let output = executor(provider)
            .run(context(node, 3), &PartialSender::disconnected("calculator"))
            .await
            .unwrap();
        assert!(output.tool_usage[0].is_error());
        assert!(output.tool_usage[0].output["error"].as_str().unwrap().contains("not listed"));
        assert!(output.decision.as_str() == "ERROR");
    }

    #[tokio::test]
    async fn malformed_arguments_are_a_tool_error() {
        let provider = ScriptedProvider::new(vec![]).then_tool_calls(
            "",
            vec![MessageToolCall {
                id: "call_1".into(),
                name: "calculator".into(),
                arguments: "{not json".into(),
            }],
        );
        let output = executor(provider)
            .run(context(calculator_node(3), 3), &PartialSender::disconnected("calculator"))
            .await
            .unwrap();
        assert_eq!(output.tool_usage[0].input, Value::String("{not json".into()));
        assert!(output.tool_usage[0].is_error());
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_the_loop() {
        let call = || {
            vec![make_tool_call(
                "call_1",
                "calculator",
                serde_json::json!({"expression": "2+2"}),
            )]
        };
        let provider = ScriptedProvider::new(vec![])
            .then_tool_calls("", call())
            .then_tool_calls("", call());
        let requests = provider.requests();

        let output = executor(provider)
            .run(context(calculator_node(2), 2), &PartialSender::disconnected("calculator"))
            .await
            .unwrap();

        assert!(output.decision.as_str() == "ERROR");
        assert_eq!(output.extra_rounds, 1);
        assert_eq!(output.tool_usage.len(), 1);
        assert!(output.agent_guidance.unwrap().contains("budget exhausted"));
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn plain_answer_uses_fallback_decision() {
        let provider = ScriptedProvider::new(vec![]).then_text("The answer is 50.");
        let output = executor(provider)
            .run(context(calculator_node(3), 3), &PartialSender::disconnected("calculator"))
            .await
            .unwrap();
        assert_eq!(output.decision.as_str(), "COMPLETE");
        assert_eq!(output.response, "The answer is 50.");
        assert!(output.tool_usage.is_empty());
        assert_eq!(output.extra_rounds, 0);
    }

    #[test]
    fn system_prompt_lists_table_decisions() {
        let prompt = InnerAgentExecutor::system_prompt(&calculator_node(3));
        assert!(prompt.contains("one of COMPLETE"));
    }
}
