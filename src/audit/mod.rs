//! Structured audit trail for policy evaluations.
//!
//! Every audited evaluation produces a causally linked sequence of
//! [`AuditEvent`]s rooted at `policy.start`. Events are fanned out to the
//! registered [`AuditSink`]s as they happen; [`build_explain_tree`] rebuilds
//! the causal forest afterwards from a flat list.

mod handler;
mod sink;
mod tree;

pub use handler::AuditHandler;
pub use sink::{Audit, AuditSink, FnAuditSink, MemoryAuditSink, SharedAuditSink, TracingAuditSink};
pub use tree::{build_explain_tree, ExplainNode};

use crate::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Evaluation opened
    #[serde(rename = "policy.start")]
    PolicyStart,
    /// A rule is about to run
    #[serde(rename = "rule.start")]
    RuleStart,
    /// A rule produced its result
    #[serde(rename = "rule.decision")]
    RuleDecision,
    /// A rule finished, carries its duration
    #[serde(rename = "rule.end")]
    RuleEnd,
    /// Final policy decision
    #[serde(rename = "policy.decision")]
    PolicyDecision,
    /// Evaluation closed; no further events are accepted
    #[serde(rename = "policy.end")]
    PolicyEnd,
    /// Free-form event emitted by a rule or hook
    #[serde(rename = "extension.event")]
    ExtensionEvent,
}

impl AuditEventType {
    /// Get the dotted wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::PolicyStart => "policy.start",
            AuditEventType::RuleStart => "rule.start",
            AuditEventType::RuleDecision => "rule.decision",
            AuditEventType::RuleEnd => "rule.end",
            AuditEventType::PolicyDecision => "policy.decision",
            AuditEventType::PolicyEnd => "policy.end",
            AuditEventType::ExtensionEvent => "extension.event",
        }
    }

    fn requires_rule(&self) -> bool {
        matches!(
            self,
            AuditEventType::RuleStart | AuditEventType::RuleDecision | AuditEventType::RuleEnd
        )
    }

    fn requires_decision(&self) -> bool {
        matches!(
            self,
            AuditEventType::RuleDecision | AuditEventType::PolicyDecision
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name, id and version of the policy or rule an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Display name
    pub name: String,
    /// Stable id (`policy:...` / `rule:...`)
    pub id: String,
    /// Version, if the entity declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Outcome recorded in a decision event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Allowed
    Allow,
    /// Denied
    Deny,
    /// Rule did not apply
    Skip,
}

impl Outcome {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
            Outcome::Skip => "skip",
        }
    }
}

/// Decision payload of `rule.decision` / `policy.decision` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDecision {
    /// Outcome
    pub outcome: Outcome,
    /// Reason, if one was given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Caller-supplied correlation ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TraceContext {
    /// Distributed trace id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Request id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One entry of an evaluation's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Event id (`event:...`)
    pub id: String,
    /// Event kind
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Evaluation this event belongs to (`eval:...`)
    pub evaluation_id: String,
    /// Policy under evaluation
    pub policy: EntityRef,
    /// Rule the event refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<EntityRef>,
    /// Decision payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<AuditDecision>,
    /// Correlation ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
    /// Elapsed time for `*.end` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Causal parent event id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl AuditEvent {
    /// Check the structural invariants of an event.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid_event("event id cannot be empty"));
        }
        if self.evaluation_id.is_empty() {
            return Err(Error::invalid_event("evaluation id cannot be empty"));
        }
        if self.policy.id.is_empty() {
            return Err(Error::invalid_event("policy id cannot be empty"));
        }
        if self.event_type.requires_rule() && self.rule.is_none() {
            return Err(Error::invalid_event(format!(
                "{} event requires a rule reference",
                self.event_type
            )));
        }
        if self.event_type.requires_decision() && self.decision.is_none() {
            return Err(Error::invalid_event(format!(
                "{} event requires a decision",
                self.event_type
            )));
        }
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(Error::invalid_event("event cannot be its own parent"));
        }
        Ok(())
    }

    /// One-line human-readable summary, used by the explain renderer.
    pub fn summary(&self) -> String {
        let subject = match &self.rule {
            Some(rule) => rule.name.as_str(),
            None => self.policy.name.as_str(),
        };
        let mut line = format!("{} {}", self.event_type, subject);
        if let Some(decision) = &self.decision {
            line.push_str(&format!(" => {}", decision.outcome.as_str()));
            if let Some(reason) = &decision.reason {
                line.push_str(&format!(" ({})", reason));
            }
        }
        if let Some(ms) = self.duration_ms {
            line.push_str(&format!(" [{:.3}ms]", ms));
        }
        line
    }
}

/// Parse an audit log: either a JSON array of events or one event per line.
/// Blank lines are ignored and every event is validated.
pub fn parse_event_log(log: &str) -> Result<Vec<AuditEvent>> {
    let trimmed = log.trim_start();
    let events: Vec<AuditEvent> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    Error::invalid_event(format!("line {}: {}", n + 1, e))
                })
            })
            .collect::<Result<_>>()?
    };
    for event in &events {
        event.validate()?;
    }
    Ok(events)
}
