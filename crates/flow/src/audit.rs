//! Audit trail: the one collaborator that sees unredacted Steps.
//!
//! The engine hands every appended Step, hidden fields included, to the
//! configured [`AuditSink`]. Nothing here is ever sent to the user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

use superego_core::step::Step;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub step: Step,
}

impl AuditEntry {
    pub fn new(instance_id: impl Into<String>, step: Step) -> Self {
        Self {
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
            step,
        }
    }
}

/// Where audit entries are written.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// In-memory audit log that also forwards to other sinks.
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    /// Entries of one instance, in append order.
    pub fn for_instance(&self, instance_id: &str) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl AuditSink for AuditLog {
    fn record(&self, entry: &AuditEntry) {
        self.lock().push(entry.clone());
        for sink in &self.sinks {
            sink.record(entry);
        }
    }
}

/// Logs audit entries through `tracing`. Hidden fields only go out at debug.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        let step = &entry.step;
        tracing::info!(
            instance_id = %entry.instance_id,
            agent_id = %step.agent_id,
            role = ?step.role,
            decision = ?step.decision.as_ref().map(|d| d.as_str()),
            next_agent = ?step.next_agent,
            tools = step.tool_usage.len(),
            "AUDIT"
        );
        tracing::debug!(
            instance_id = %entry.instance_id,
            step_id = %step.step_id,
            thinking = ?step.thinking,
            agent_guidance = ?step.agent_guidance,
            "AUDIT hidden fields"
        );
    }
}
