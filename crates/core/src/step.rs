//! Steps: one node's recorded execution.
//!
//! A [`Step`] carries everything the node produced, including two hidden
//! fields (`thinking`, `agent_guidance`). Anything that leaves the core
//! toward the user goes through [`PublicStep`], which has no such fields at
//! all, so redaction cannot be forgotten field by field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::Decision;
use crate::message::Role;

/// One tool invocation made by an executor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub input: serde_json::Value,
    /// Tool output, or `{"error": ...}` when the call failed
    pub output: serde_json::Value,
}

impl ToolUsage {
    pub fn is_error(&self) -> bool {
        self.output.get("error").is_some()
    }
}

/// An immutable record of a single node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,

    /// Node identity that produced this step ("user" for user input)
    pub agent_id: String,

    pub timestamp: DateTime<Utc>,

    pub role: Role,

    /// Text the node consumed; absent on user steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    // Evaluator fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constitution_text_used: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,

    // Executor fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_used: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_usage: Vec<ToolUsage>,

    // Hidden fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_guidance: Option<String>,

    // Visible fields
    #[serde(default)]
    pub response: String,

    /// Resolved next node id; `None` means the flow ended here
    #[serde(default)]
    pub next_agent: Option<String>,
}

impl Step {
    fn blank(agent_id: impl Into<String>, role: Role) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            role,
            input: None,
            constitution_text_used: None,
            decision: None,
            system_prompt_used: None,
            tool_usage: Vec::new(),
            thinking: None,
            agent_guidance: None,
            response: String::new(),
            next_agent: None,
        }
    }

    /// The origin step of a submission: the raw user text as `response`.
    pub fn user(text: impl Into<String>, next_agent: impl Into<String>) -> Self {
        let mut step = Self::blank("user", Role::User);
        step.response = text.into();
        step.next_agent = Some(next_agent.into());
        step
    }

    /// A step produced by an agent node.
    pub fn assistant(agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        let mut step = Self::blank(agent_id, Role::Assistant);
        step.input = Some(input.into());
        step
    }

    /// An engine-generated diagnostic step (e.g. an iteration cap was hit).
    pub fn system(agent_id: impl Into<String>, response: impl Into<String>) -> Self {
        let mut step = Self::blank(agent_id, Role::System);
        step.response = response.into();
        step
    }

    /// Copy of this step in the requested export scope.
    pub fn export(&self, scope: ExportScope) -> Step {
        match scope {
            ExportScope::Internal => self.clone(),
            ExportScope::Public => Step {
                thinking: None,
                agent_guidance: None,
                ..self.clone()
            },
        }
    }
}

/// How much of a step a collaborator is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportScope {
    /// Hidden fields stripped
    #[default]
    Public,
    /// Everything, for collaborators explicitly marked internal (audit)
    Internal,
}

/// A Step as it may cross the user boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicStep {
    pub step_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constitution_text_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_used: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_usage: Vec<ToolUsage>,
    pub response: String,
    pub next_agent: Option<String>,
}

impl From<&Step> for PublicStep {
    fn from(step: &Step) -> Self {
        Self {
            step_id: step.step_id.clone(),
            agent_id: step.agent_id.clone(),
            timestamp: step.timestamp,
            role: step.role,
            input: step.input.clone(),
            constitution_text_used: step.constitution_text_used.clone(),
            decision: step.decision.clone(),
            system_prompt_used: step.system_prompt_used.clone(),
            tool_usage: step.tool_usage.clone(),
            response: step.response.clone(),
            next_agent: step.next_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::SuperegoDecision;

    fn evaluated_step() -> Step {
        let mut step = Step::assistant("input_superego", "Calculate 5*10");
        step.decision = Some(Decision::Superego(SuperegoDecision::Accept));
        step.thinking = Some("arithmetic is harmless".into());
        step.agent_guidance = Some("plain arithmetic".into());
        step.response = "Looks fine.".into();
        step.next_agent = Some("calculator".into());
        step
    }

    #[test]
    fn user_step_has_response_and_no_input() {
        let step = Step::user("Calculate 5*10", "input_superego");
        assert_eq!(step.role, Role::User);
        assert!(step.input.is_none());
        assert_eq!(step.response, "Calculate 5*10");
        assert_eq!(step.next_agent.as_deref(), Some("input_superego"));
    }

    #[test]
    fn public_step_json_has_no_hidden_fields() {
        let step = evaluated_step();
        let json = serde_json::to_value(PublicStep::from(&step)).unwrap();
        assert!(json.get("thinking").is_none());
        assert!(json.get("agent_guidance").is_none());
        assert_eq!(json["decision"], "ACCEPT");
        assert_eq!(json["next_agent"], "calculator");
    }

    #[test]
    fn export_scope_controls_hidden_fields() {
        let step = evaluated_step();
        let public = step.export(ExportScope::Public);
        assert!(public.thinking.is_none());
        assert!(public.agent_guidance.is_none());
        assert_eq!(public.step_id, step.step_id);

        let internal = step.export(ExportScope::Internal);
        assert_eq!(internal.agent_guidance.as_deref(), Some("plain arithmetic"));
    }

    #[test]
    fn end_of_flow_serializes_null_next_agent() {
        let mut step = evaluated_step();
        step.next_agent = None;
        let json = serde_json::to_value(&step).unwrap();
        assert!(json["next_agent"].is_null());
    }

    #[test]
    fn tool_usage_error_detection() {
        let usage = ToolUsage {
            tool_name: "calculator".into(),
            input: serde_json::json!({"expression": "1/0"}),
            output: serde_json::json!({"error": "division by zero"}),
        };
        assert!(usage.is_error());
    }
}
