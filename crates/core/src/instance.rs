//! Flow instances and their append-only records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::step::{PublicStep, Step};

/// The ordered Steps of one conversation.
///
/// There is no way to remove or replace a Step once pushed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowRecord(Vec<Step>);

impl FlowRecord {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, step: Step) {
        self.0.push(step);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Step> {
        self.0.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.0.iter()
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    /// Redacted snapshot for the user boundary.
    pub fn public(&self) -> Vec<PublicStep> {
        self.0.iter().map(PublicStep::from).collect()
    }
}

impl From<Vec<Step>> for FlowRecord {
    fn from(steps: Vec<Step>) -> Self {
        Self(steps)
    }
}

impl<'a> IntoIterator for &'a FlowRecord {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Lifecycle of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Created,
    Running,
    Blocked,
    Completed,
    Error,
    Cancelled,
}

impl FlowStatus {
    /// Whether a submission is currently driving this instance.
    pub fn is_running(&self) -> bool {
        matches!(self, FlowStatus::Running)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowStatus::Created => "created",
            FlowStatus::Running => "running",
            FlowStatus::Blocked => "blocked",
            FlowStatus::Completed => "completed",
            FlowStatus::Error => "error",
            FlowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One running or finished execution of a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: String,

    pub definition_id: String,

    #[serde(default)]
    pub record: FlowRecord,

    /// Node about to run; `None` once the flow reached its end
    #[serde(default)]
    pub current_node: Option<String>,

    /// Executions per node id for the current submission
    #[serde(default)]
    pub iterations: HashMap<String, u32>,

    pub status: FlowStatus,

    /// Rendered structural failure, when `status = error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl FlowInstance {
    pub fn new(definition_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            definition_id: definition_id.into(),
            record: FlowRecord::new(),
            current_node: None,
            iterations: HashMap::new(),
            status: FlowStatus::Created,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Same instance without its Steps, as persisted in the header record.
    pub fn header(&self) -> FlowInstance {
        FlowInstance {
            record: FlowRecord::new(),
            ..self.clone()
        }
    }

    /// Redacted view for the user boundary.
    pub fn public_view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            definition_id: self.definition_id.clone(),
            status: self.status,
            current_node: self.current_node.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            steps: self.record.public(),
        }
    }
}

/// A [`FlowInstance`] with a redacted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: String,
    pub definition_id: String,
    pub status: FlowStatus,
    pub current_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<PublicStep>,
}
