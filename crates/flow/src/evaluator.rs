//! Constitution evaluator: the Superego node kind.
//!
//! Judges its input against the node's constitution in a single generation
//! and returns one of the four [`SuperegoDecision`]s. Guidance from the
//! previous step is given to the model as a separate system message marked
//! as never shown to the user.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use superego_core::decision::SuperegoDecision;
use superego_core::error::FlowError;
use superego_core::flow::{NodeConfig, NodeKind, SuperegoNode};
use superego_core::message::Message;
use superego_core::provider::ProviderRequest;
use superego_providers::ProviderRouter;

use crate::multiplexer::PartialSender;
use crate::node::{GenerationSettings, NodeContext, NodeOutput, NodeRunner, stream_generation};
use crate::parse::parse_superego_output;

pub struct ConstitutionEvaluator {
    router: Arc<ProviderRouter>,
    settings: GenerationSettings,
}

impl ConstitutionEvaluator {
    pub fn new(router: Arc<ProviderRouter>, settings: GenerationSettings) -> Self {
        Self { router, settings }
    }

    fn system_prompt(node: &SuperegoNode) -> String {
        let name = node.constitution_name.as_deref().unwrap_or("constitution");
        let decisions = SuperegoDecision::ALL
            .iter()
            .map(|d| d.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "You are a superego: you review a request against the constitution below \
             before any other agent acts on it.\n\n\
             <constitution name=\"{name}\">\n{}\n</constitution>\n\n\
             Answer in this format:\n\
             <thinking>your private reasoning</thinking>\n\
             <decision>one of {decisions}</decision>\n\
             <agent_guidance>notes for the next agent, never shown to the user</agent_guidance>\n\
             <response>what the user sees</response>\n\n\
             BLOCK refuses the request and ends the conversation. CAUTION lets it \
             proceed with the caveat in agent_guidance. NEEDS_CLARIFICATION asks \
             the user a question in the response.",
            node.constitution.trim()
        )
    }
}

/// The system message carrying guidance from the previous step.
pub(crate) fn guidance_message(guidance: &str) -> Message {
    Message::system(format!(
        "Guidance from the previous step (not visible to the user):\n{guidance}"
    ))
}

#[async_trait]
impl NodeRunner for ConstitutionEvaluator {
    fn kind(&self) -> NodeKind {
        NodeKind::Superego
    }

    async fn run(
        &self,
        ctx: NodeContext,
        partials: &PartialSender,
    ) -> Result<NodeOutput, FlowError> {
        let NodeConfig::Superego(node) = &ctx.node else {
            return Err(ctx.wrong_kind(NodeKind::Superego));
        };

        let mut messages = vec![Message::system(Self::system_prompt(node))];
        if let Some(guidance) = &ctx.guidance {
            messages.push(guidance_message(guidance));
        }
        messages.push(Message::user(&ctx.input));

        let (provider, model) = self.settings.resolve(&self.router, &ctx)?;
        let request = ProviderRequest {
            model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: vec![],
            stream: true,
        };

        let (text, _) = stream_generation(provider.as_ref(), request, partials)
            .await
            .map_err(|e| ctx.failed(e))?;

        let parsed = parse_superego_output(&text);
        debug!(node = %ctx.node_id, decision = %parsed.decision, "Evaluator decided");

        Ok(NodeOutput {
            decision: parsed.decision.into(),
            thinking: parsed.thinking,
            agent_guidance: parsed.agent_guidance,
            response: parsed.response,
            tool_usage: vec![],
            constitution_text_used: Some(node.constitution.clone()),
            system_prompt_used: None,
            extra_rounds: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::StreamMultiplexer;
    use crate::stream_event::FlowStreamEvent;
    use crate::test_helpers::ScriptedProvider;
    use superego_core::decision::Decision;
    use superego_core::flow::TransitionTable;
    use superego_core::message::Role;
    use tokio::sync::mpsc;

    fn context(guidance: Option<&str>) -> NodeContext {
        NodeContext {
            instance_id: "i-1".into(),
            node_id: "input_superego".into(),
            agent_id: "input_superego".into(),
            node: NodeConfig::Superego(SuperegoNode {
                agent_id: None,
                max_iterations: 3,
                model: None,
                constitution_name: Some("default".into()),
                constitution: "Refuse anything harmful.".into(),
                transitions: TransitionTable::new(),
            }),
            input: "Calculate 5*10".into(),
            guidance: guidance.map(String::from),
            round_budget: 1,
        }
    }

    #[tokio::test]
    async fn evaluator_parses_tagged_output_and_streams_only_the_response() {
        let provider = ScriptedProvider::new(vec![]).then_text(
            "<thinking>plain arithmetic</thinking><decision>ACCEPT</decision>\
             <agent_guidance>compute it</agent_guidance><response>This request is fine.</response>",
        );
        let requests = provider.requests();
        let evaluator = ConstitutionEvaluator::new(
            Arc::new(ScriptedProvider::router(provider)),
            GenerationSettings::default(),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let mux = StreamMultiplexer::new(tx, "i-1");
        let output = evaluator
            .run(context(None), &mux.partials("input_superego"))
            .await
            .unwrap();
        drop(mux);

        assert_eq!(output.decision, Decision::Superego(SuperegoDecision::Accept));
        assert_eq!(output.thinking.as_deref(), Some("plain arithmetic"));
        assert_eq!(output.agent_guidance.as_deref(), Some("compute it"));
        assert_eq!(output.response, "This request is fine.");
        assert_eq!(output.constitution_text_used.as_deref(), Some("Refuse anything harmful."));

        let mut visible = String::new();
        while let Some(event) = rx.recv().await {
            if let FlowStreamEvent::PartialOutput { content, agent_id, .. } = event {
                assert_eq!(agent_id, "input_superego");
                visible.push_str(&content);
            }
        }
        assert_eq!(visible, "This request is fine.");

        let requests = requests.lock().unwrap();
        let system = &requests[0].messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("Refuse anything harmful."));
        assert!(requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn fenced_json_after_prose_keeps_hidden_fields_out_of_partials() {
        let provider = ScriptedProvider::new(vec![]).then_text(
            "Here is my verdict:\n```json\n{\"thinking\": \"SECRET-THOUGHT\", \
             \"decision\": \"ACCEPT\", \"agent_guidance\": \"SECRET-GUIDANCE\", \
             \"response\": \"ok\"}\n```",
        );
        let evaluator = ConstitutionEvaluator::new(
            Arc::new(ScriptedProvider::router(provider)),
            GenerationSettings::default(),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let mux = StreamMultiplexer::new(tx, "i-1");
        let output = evaluator
            .run(context(None), &mux.partials("input_superego"))
            .await
            .unwrap();
        drop(mux);

        assert_eq!(output.thinking.as_deref(), Some("SECRET-THOUGHT"));
        assert_eq!(output.agent_guidance.as_deref(), Some("SECRET-GUIDANCE"));
        assert_eq!(output.response, "ok");

        let mut visible = String::new();
        while let Some(event) = rx.recv().await {
            if let FlowStreamEvent::PartialOutput { content, .. } = event {
                visible.push_str(&content);
            }
        }
        assert!(!visible.contains("SECRET"), "leaked: {visible}");
    }

    #[tokio::test]
    async fn incoming_guidance_is_passed_as_system_message() {
        let provider = ScriptedProvider::new(vec![])
            .then_text("<decision>ACCEPT</decision><response>ok</response>");
        let requests = provider.requests();
        let evaluator = ConstitutionEvaluator::new(
            Arc::new(ScriptedProvider::router(provider)),
            GenerationSettings::default(),
        );

        evaluator
            .run(context(Some("user seems confused")), &PartialSender::disconnected("e"))
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), 3);
        assert!(messages[1].content.contains("user seems confused"));
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].content, "Calculate 5*10");
    }

    #[tokio::test]
    async fn garbled_decision_fails_closed() {
        let provider = ScriptedProvider::new(vec![])
            .then_text("<decision>YES PLEASE</decision><response>sure</response>");
        let evaluator = ConstitutionEvaluator::new(
            Arc::new(ScriptedProvider::router(provider)),
            GenerationSettings::default(),
        );
        let output = evaluator
            .run(context(None), &PartialSender::disconnected("e"))
            .await
            .unwrap();
        assert_eq!(output.decision, Decision::Superego(SuperegoDecision::Caution));
        assert!(output.agent_guidance.unwrap().contains("YES PLEASE"));
    }

    #[tokio::test]
    async fn provider_failure_is_a_node_failure() {
        let provider = ScriptedProvider::new(vec![])
            .then_error(superego_core::error::ProviderError::Network("unreachable".into()));
        let evaluator = ConstitutionEvaluator::new(
            Arc::new(ScriptedProvider::router(provider)),
            GenerationSettings::default(),
        );
        let err = evaluator
            .run(context(None), &PartialSender::disconnected("e"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NodeFailed { node, .. } if node == "input_superego"));
    }
}
