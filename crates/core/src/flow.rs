//! Flow definitions: the static graph an engine walks.
//!
//! A definition is a map of node id to node configuration plus a start node.
//! Each node carries its own transition table keyed by the decision type of
//! its kind. Targets are a node id, `"self"` (re-enter the same node) or the
//! end of the flow (`"end"`, or `null` in JSON).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::decision::{AgentDecision, Decision, SuperegoDecision};
use crate::error::FlowError;

/// Node ids that collide with transition keywords.
pub const RESERVED_NODE_IDS: [&str; 2] = ["end", "self"];

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum Target {
    Node(String),
    SelfLoop,
    End,
}

impl Target {
    /// The node the engine moves to, given the node it is leaving.
    pub fn next_node<'a>(&'a self, current: &'a str) -> Option<&'a str> {
        match self {
            Target::Node(id) => Some(id.as_str()),
            Target::SelfLoop => Some(current),
            Target::End => None,
        }
    }
}

impl From<Option<String>> for Target {
    fn from(value: Option<String>) -> Self {
        match value {
            None => Target::End,
            Some(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("end") {
                    Target::End
                } else if trimmed.eq_ignore_ascii_case("self") {
                    Target::SelfLoop
                } else {
                    Target::Node(trimmed.to_string())
                }
            }
        }
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        match value {
            Target::Node(id) => id,
            Target::SelfLoop => "self".into(),
            Target::End => "end".into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(id) => f.write_str(id),
            Target::SelfLoop => f.write_str("self"),
            Target::End => f.write_str("end"),
        }
    }
}

/// Decision → target mapping for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionTable<D: Ord>(BTreeMap<D, Target>);

impl<D: Ord> TransitionTable<D> {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, decision: D, target: Target) -> Self {
        self.0.insert(decision, target);
        self
    }

    pub fn resolve(&self, decision: &D) -> Option<&Target> {
        self.0.get(decision)
    }

    pub fn contains(&self, decision: &D) -> bool {
        self.0.contains_key(decision)
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&D, &Target)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<D: Ord> Default for TransitionTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn default_max_iterations() -> u32 {
    3
}

fn default_fallback_decision() -> AgentDecision {
    AgentDecision::complete()
}

/// Configuration of a constitution evaluator node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperegoNode {
    /// Identity shown on steps and partial output (defaults to the node id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Model override for this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Human-readable name of the rule-set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constitution_name: Option<String>,

    /// The rule-set text the input is judged against
    pub constitution: String,

    #[serde(default)]
    pub transitions: TransitionTable<SuperegoDecision>,
}

/// Configuration of an inner agent (executor) node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerAgentNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub system_prompt: String,

    /// Tools this node may call; nothing else is exposed to it
    #[serde(default)]
    pub tools: Vec<String>,

    /// Decision used when the model answers in plain text with no envelope
    #[serde(default = "default_fallback_decision")]
    pub fallback_decision: AgentDecision,

    #[serde(default)]
    pub transitions: TransitionTable<AgentDecision>,
}

/// The kind of a node, used to pick its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Superego,
    InnerAgent,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Superego => f.write_str("superego"),
            NodeKind::InnerAgent => f.write_str("inner_agent"),
        }
    }
}

/// One node of a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Superego(SuperegoNode),
    InnerAgent(InnerAgentNode),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Superego(_) => NodeKind::Superego,
            NodeConfig::InnerAgent(_) => NodeKind::InnerAgent,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        match self {
            NodeConfig::Superego(n) => n.max_iterations,
            NodeConfig::InnerAgent(n) => n.max_iterations,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            NodeConfig::Superego(n) => n.model.as_deref(),
            NodeConfig::InnerAgent(n) => n.model.as_deref(),
        }
    }

    fn explicit_agent_id(&self) -> Option<&str> {
        match self {
            NodeConfig::Superego(n) => n.agent_id.as_deref(),
            NodeConfig::InnerAgent(n) => n.agent_id.as_deref(),
        }
    }

    /// All targets in this node's table, in decision order.
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            NodeConfig::Superego(n) => n.transitions.targets().collect(),
            NodeConfig::InnerAgent(n) => n.transitions.targets().collect(),
        }
    }

    /// Resolve a decision against this node's table.
    ///
    /// A decision of the wrong kind, or one with no entry, is an error that
    /// carries the raw value.
    pub fn resolve(&self, node_id: &str, decision: &Decision) -> Result<Target, FlowError> {
        let found = match (self, decision) {
            (NodeConfig::Superego(n), Decision::Superego(d)) => n.transitions.resolve(d),
            (NodeConfig::InnerAgent(n), Decision::Agent(d)) => n.transitions.resolve(d),
            (node, other) => {
                let returned = match other {
                    Decision::Superego(_) => NodeKind::Superego,
                    Decision::Agent(_) => NodeKind::InnerAgent,
                };
                return Err(FlowError::DecisionKindMismatch {
                    node: node_id.to_string(),
                    expected: node.kind().to_string(),
                    returned: returned.to_string(),
                });
            }
        };
        found.cloned().ok_or_else(|| FlowError::UnmatchedDecision {
            node: node_id.to_string(),
            decision: decision.as_str().to_string(),
        })
    }
}

/// A named directed graph of agent nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Node the engine enters for every submission
    pub start: String,

    pub nodes: BTreeMap<String, NodeConfig>,
}

impl FlowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.get(node_id)
    }

    /// The agent id recorded for a node: its explicit `agent_id`, else the node id.
    pub fn agent_id<'a>(&'a self, node_id: &'a str) -> &'a str {
        self.nodes
            .get(node_id)
            .and_then(|n| n.explicit_agent_id())
            .unwrap_or(node_id)
    }

    /// Superego decisions with no table entry, per node.
    ///
    /// These are legal: the engine ends the instance with `error` if one is
    /// ever produced.
    pub fn uncovered_decisions(&self) -> Vec<(&str, SuperegoDecision)> {
        let mut missing = Vec::new();
        for (id, node) in &self.nodes {
            if let NodeConfig::Superego(n) = node {
                for decision in SuperegoDecision::ALL {
                    if !n.transitions.contains(&decision) {
                        missing.push((id.as_str(), decision));
                    }
                }
            }
        }
        missing
    }

    /// Check structural soundness of the graph.
    pub fn validate(&self) -> Result<(), FlowError> {
        let invalid = |reason: String| FlowError::InvalidDefinition {
            flow: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("flow id is empty".into()));
        }
        if self.nodes.is_empty() {
            return Err(invalid("flow has no nodes".into()));
        }
        if !self.nodes.contains_key(&self.start) {
            return Err(invalid(format!("start node '{}' is not defined", self.start)));
        }

        for (id, node) in &self.nodes {
            if let NodeConfig::Superego(n) = node
                && let Some(target) = n.transitions.resolve(&SuperegoDecision::Block)
                && *target != Target::End
            {
                return Err(invalid(format!(
                    "node '{id}' routes BLOCK to '{target}'; BLOCK must end the flow"
                )));
            }
            if RESERVED_NODE_IDS.iter().any(|r| id.eq_ignore_ascii_case(r)) {
                return Err(invalid(format!("node id '{id}' is reserved")));
            }
            if node.max_iterations() == 0 {
                return Err(invalid(format!("node '{id}' has max_iterations = 0")));
            }
            for target in node.targets() {
                if let Target::Node(next) = target
                    && !self.nodes.contains_key(next)
                {
                    return Err(FlowError::UnknownNode {
                        flow: self.id.clone(),
                        node: next.clone(),
                    });
                }
            }
        }

        for (node, decision) in self.uncovered_decisions() {
            warn!(flow = %self.id, node = %node, decision = %decision, "Transition table has no entry for decision");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALCULATOR_FLOW: &str = r#"
id = "calc"
name = "Guarded calculator"
start = "input_superego"

[nodes.input_superego]
kind = "superego"
constitution_name = "default"
constitution = "Refuse harmful requests."
max_iterations = 2

[nodes.input_superego.transitions]
ACCEPT = "calculator"
CAUTION = "calculator"
BLOCK = "end"
NEEDS_CLARIFICATION = "self"

[nodes.calculator]
kind = "inner_agent"
system_prompt = "You are a calculator."
tools = ["calculator"]

[nodes.calculator.transitions]
COMPLETE = "end"
"#;

    fn calculator_flow() -> FlowDefinition {
        toml::from_str(CALCULATOR_FLOW).unwrap()
    }

    #[test]
    fn parse_flow_from_toml() {
        let flow = calculator_flow();
        assert_eq!(flow.start, "input_superego");
        assert_eq!(flow.nodes.len(), 2);

        let superego = flow.node("input_superego").unwrap();
        assert_eq!(superego.kind(), NodeKind::Superego);
        assert_eq!(superego.max_iterations(), 2);

        let calc = flow.node("calculator").unwrap();
        assert_eq!(calc.max_iterations(), 3);
        match calc {
            NodeConfig::InnerAgent(n) => {
                assert_eq!(n.tools, vec!["calculator".to_string()]);
                assert_eq!(n.fallback_decision.as_str(), "COMPLETE");
            }
            _ => panic!("expected inner agent"),
        }
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn target_keywords() {
        assert_eq!(Target::from(None), Target::End);
        assert_eq!(Target::from(Some("END".to_string())), Target::End);
        assert_eq!(Target::from(Some("self".to_string())), Target::SelfLoop);
        assert_eq!(Target::from(Some("calculator".to_string())), Target::Node("calculator".into()));

        let json_null: Target = serde_json::from_str("null").unwrap();
        assert_eq!(json_null, Target::End);
        assert_eq!(Target::SelfLoop.next_node("n1"), Some("n1"));
        assert_eq!(Target::End.next_node("n1"), None);
    }

    #[test]
    fn resolve_self_and_end() {
        let flow = calculator_flow();
        let node = flow.node("input_superego").unwrap();

        let clarify = Decision::Superego(SuperegoDecision::NeedsClarification);
        assert_eq!(node.resolve("input_superego", &clarify).unwrap(), Target::SelfLoop);

        let block = Decision::Superego(SuperegoDecision::Block);
        assert_eq!(node.resolve("input_superego", &block).unwrap(), Target::End);
    }

    #[test]
    fn resolve_unmatched_keeps_raw_decision() {
        let flow = calculator_flow();
        let node = flow.node("calculator").unwrap();
        let decision = Decision::Agent(AgentDecision::error());

        match node.resolve("calculator", &decision) {
            Err(FlowError::UnmatchedDecision { node, decision }) => {
                assert_eq!(node, "calculator");
                assert_eq!(decision, "ERROR");
            }
            other => panic!("expected unmatched decision, got {other:?}"),
        }
    }

    #[test]
    fn resolve_wrong_kind_is_rejected() {
        let flow = calculator_flow();
        let node = flow.node("calculator").unwrap();
        let decision = Decision::Superego(SuperegoDecision::Accept);
        assert!(matches!(
            node.resolve("calculator", &decision),
            Err(FlowError::DecisionKindMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_start_and_dangling_target() {
        let mut flow = calculator_flow();
        flow.start = "missing".into();
        assert!(matches!(flow.validate(), Err(FlowError::InvalidDefinition { .. })));

        let mut flow = calculator_flow();
        if let Some(NodeConfig::InnerAgent(n)) = flow.nodes.get_mut("calculator") {
            n.transitions = TransitionTable::new()
                .with(AgentDecision::complete(), Target::Node("reviewer".into()));
        }
        assert!(matches!(flow.validate(), Err(FlowError::UnknownNode { .. })));
    }

    #[test]
    fn validate_rejects_reserved_ids_and_zero_cap() {
        let mut flow = calculator_flow();
        let node = flow.nodes.remove("calculator").unwrap();
        flow.nodes.insert("end".into(), node);
        if let Some(NodeConfig::Superego(n)) = flow.nodes.get_mut("input_superego") {
            n.transitions = TransitionTable::new();
        }
        assert!(flow.validate().is_err());

        let mut flow = calculator_flow();
        if let Some(NodeConfig::Superego(n)) = flow.nodes.get_mut("input_superego") {
            n.max_iterations = 0;
        }
        assert!(flow.validate().is_err());
    }

    #[test]
    fn validate_rejects_block_that_continues() {
        let mut flow = calculator_flow();
        if let Some(NodeConfig::Superego(n)) = flow.nodes.get_mut("input_superego") {
            n.transitions = n
                .transitions
                .clone()
                .with(SuperegoDecision::Block, Target::Node("calculator".into()));
        }
        assert!(matches!(flow.validate(), Err(FlowError::InvalidDefinition { .. })));
    }

    #[test]
    fn uncovered_superego_decisions_are_reported() {
        let mut flow = calculator_flow();
        if let Some(NodeConfig::Superego(n)) = flow.nodes.get_mut("input_superego") {
            n.transitions = TransitionTable::new()
                .with(SuperegoDecision::Accept, Target::Node("calculator".into()));
        }
        let missing = flow.uncovered_decisions();
        assert_eq!(missing.len(), 3);
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn agent_id_defaults_to_node_id() {
        let mut flow = calculator_flow();
        assert_eq!(flow.agent_id("calculator"), "calculator");
        if let Some(NodeConfig::InnerAgent(n)) = flow.nodes.get_mut("calculator") {
            n.agent_id = Some("calc-agent".into());
        }
        assert_eq!(flow.agent_id("calculator"), "calc-agent");
    }

    #[test]
    fn definition_survives_toml_round_trip() {
        let flow = calculator_flow();
        let text = toml::to_string(&flow).unwrap();
        let back: FlowDefinition = toml::from_str(&text).unwrap();
        assert_eq!(back.nodes.len(), 2);
        assert_eq!(
            back.node("input_superego")
                .unwrap()
                .resolve("input_superego", &Decision::Superego(SuperegoDecision::Block))
                .unwrap(),
            Target::End
        );
    }
}
