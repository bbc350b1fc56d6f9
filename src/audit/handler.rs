//! Per-evaluation audit handler.

use super::{
    Audit, AuditDecision, AuditEvent, AuditEventType, EntityRef, Outcome, TraceContext,
};
use crate::ids::SharedIdGenerator;
use crate::{Error, Result};

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Emits the events of one evaluation and links them causally.
///
/// `policy.start` is the root; rule events hang off it, and the `rule.decision`
/// / `rule.end` of a rule hang off that rule's `rule.start`. Once `policy.end`
/// has been emitted the handler is closed and every further emit fails with
/// [`Error::AuditClosed`]. Cloning shares the same trail.
#[derive(Clone)]
pub struct AuditHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    audit: Audit,
    policy: EntityRef,
    evaluation_id: String,
    trace: Option<TraceContext>,
    ids: SharedIdGenerator,
    root_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

/// Everything but the bookkeeping fields of an event.
struct Draft {
    event_type: AuditEventType,
    rule: Option<EntityRef>,
    decision: Option<AuditDecision>,
    meta: Option<serde_json::Map<String, serde_json::Value>>,
    duration_ms: Option<f64>,
    parent_id: Option<String>,
}

impl Draft {
    fn new(event_type: AuditEventType, parent_id: Option<String>) -> Self {
        Self {
            event_type,
            rule: None,
            decision: None,
            meta: None,
            duration_ms: None,
            parent_id,
        }
    }
}

impl AuditHandler {
    pub(crate) fn new(
        audit: Audit,
        policy: EntityRef,
        evaluation_id: String,
        trace: Option<TraceContext>,
        ids: SharedIdGenerator,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                audit,
                policy,
                evaluation_id,
                trace,
                ids,
                root_id: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The evaluation this handler records.
    pub fn evaluation_id(&self) -> &str {
        &self.inner.evaluation_id
    }

    /// Whether `policy.end` has been emitted.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Id of the `policy.start` event, once emitted.
    pub fn root_id(&self) -> Option<String> {
        self.inner.root_id.lock().clone()
    }

    /// Emit `policy.start`.
    pub async fn policy_start(&self) -> Result<String> {
        let id = self
            .emit(Draft::new(AuditEventType::PolicyStart, None))
            .await?;
        *self.inner.root_id.lock() = Some(id.clone());
        Ok(id)
    }

    /// Emit `rule.start`; returns its id for linking the rule's later events.
    pub async fn rule_start(&self, rule: &EntityRef) -> Result<String> {
        let mut draft = Draft::new(AuditEventType::RuleStart, self.root_id());
        draft.rule = Some(rule.clone());
        self.emit(draft).await
    }

    /// Emit `rule.decision` under the rule's `rule.start`.
    pub async fn rule_decision(
        &self,
        rule: &EntityRef,
        rule_start_id: &str,
        outcome: Outcome,
        reason: Option<String>,
    ) -> Result<String> {
        let mut draft = Draft::new(AuditEventType::RuleDecision, Some(rule_start_id.to_string()));
        draft.rule = Some(rule.clone());
        draft.decision = Some(AuditDecision { outcome, reason });
        self.emit(draft).await
    }

    /// Emit `rule.end` under the rule's `rule.start`.
    pub async fn rule_end(
        &self,
        rule: &EntityRef,
        rule_start_id: &str,
        duration_ms: f64,
    ) -> Result<String> {
        let mut draft = Draft::new(AuditEventType::RuleEnd, Some(rule_start_id.to_string()));
        draft.rule = Some(rule.clone());
        draft.duration_ms = Some(duration_ms);
        self.emit(draft).await
    }

    /// Emit `policy.decision`.
    pub async fn policy_decision(&self, outcome: Outcome, reason: Option<String>) -> Result<String> {
        let mut draft = Draft::new(AuditEventType::PolicyDecision, self.root_id());
        draft.decision = Some(AuditDecision { outcome, reason });
        self.emit(draft).await
    }

    /// Emit `policy.end` and close the handler.
    pub async fn policy_end(&self, duration_ms: f64) -> Result<String> {
        let mut draft = Draft::new(AuditEventType::PolicyEnd, self.root_id());
        draft.duration_ms = Some(duration_ms);
        self.emit(draft).await
    }

    /// Emit an `extension.event`. Without an explicit parent the event hangs
    /// off `policy.start`.
    pub async fn extension(
        &self,
        parent_id: Option<&str>,
        rule: Option<&EntityRef>,
        meta: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let parent = parent_id.map(str::to_string).or_else(|| self.root_id());
        let mut draft = Draft::new(AuditEventType::ExtensionEvent, parent);
        draft.rule = rule.cloned();
        draft.meta = Some(meta);
        self.emit(draft).await
    }

    async fn emit(&self, draft: Draft) -> Result<String> {
        let inner = &self.inner;
        let closing = draft.event_type == AuditEventType::PolicyEnd;
        if closing {
            // Claim the close so a concurrent second policy.end is rejected.
            if inner.closed.swap(true, Ordering::AcqRel) {
                return Err(Error::audit_closed(&inner.evaluation_id));
            }
        } else if self.is_closed() {
            return Err(Error::audit_closed(&inner.evaluation_id));
        }

        let event = AuditEvent {
            id: inner.ids.event_id(),
            event_type: draft.event_type,
            timestamp: Utc::now(),
            evaluation_id: inner.evaluation_id.clone(),
            policy: inner.policy.clone(),
            rule: draft.rule,
            decision: draft.decision,
            trace: inner.trace.clone(),
            meta: draft.meta,
            duration_ms: draft.duration_ms,
            parent_id: draft.parent_id,
        };
        event.validate()?;

        inner.audit.publish(&event).await;
        Ok(event.id)
    }
}

impl std::fmt::Debug for AuditHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditHandler")
            .field("evaluation_id", &self.inner.evaluation_id)
            .field("policy", &self.inner.policy.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::ids::SequentialGenerator;

    fn open() -> (Arc<MemoryAuditSink>, AuditHandler) {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = Audit::new().with_sink(sink.clone());
        let policy = EntityRef {
            name: "age-check".to_string(),
            id: "policy:age-check".to_string(),
            version: Some("1.0.0".to_string()),
        };
        let trace = TraceContext {
            trace_id: Some("trace-1".to_string()),
            request_id: None,
        };
        let handler = audit.open(
            policy,
            "eval:1",
            Some(trace),
            Arc::new(SequentialGenerator::new()),
        );
        (sink, handler)
    }

    fn rule() -> EntityRef {
        EntityRef {
            name: "is-adult".to_string(),
            id: "rule:is-adult".to_string(),
            version: None,
        }
    }

    #[tokio::test]
    async fn test_events_are_linked() {
        let (sink, handler) = open();
        let root = handler.policy_start().await.unwrap();
        let start = handler.rule_start(&rule()).await.unwrap();
        handler
            .rule_decision(&rule(), &start, Outcome::Allow, None)
            .await
            .unwrap();
        handler.rule_end(&rule(), &start, 0.5).await.unwrap();
        handler.policy_decision(Outcome::Allow, None).await.unwrap();
        handler.policy_end(1.0).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].parent_id, None);
        assert_eq!(events[1].parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(events[2].parent_id.as_deref(), Some(start.as_str()));
        assert_eq!(events[3].parent_id.as_deref(), Some(start.as_str()));
        assert_eq!(events[4].parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(events[5].parent_id.as_deref(), Some(root.as_str()));
        assert!(events
            .iter()
            .all(|e| e.trace.as_ref().and_then(|t| t.trace_id.as_deref()) == Some("trace-1")));
    }

    #[tokio::test]
    async fn test_emit_after_end_is_rejected() {
        let (sink, handler) = open();
        handler.policy_start().await.unwrap();
        handler.policy_end(0.0).await.unwrap();
        assert!(handler.is_closed());

        let err = handler
            .extension(None, None, serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuditClosed { .. }));

        let err = handler.policy_end(0.0).await.unwrap_err();
        assert!(matches!(err, Error::AuditClosed { .. }));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_extension_defaults_to_root_parent() {
        let (sink, handler) = open();
        let root = handler.policy_start().await.unwrap();
        let mut meta = serde_json::Map::new();
        meta.insert("quota".to_string(), serde_json::json!(3));
        handler.extension(None, None, meta).await.unwrap();

        let events = sink.events();
        assert_eq!(events[1].event_type, AuditEventType::ExtensionEvent);
        assert_eq!(events[1].parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(events[1].meta.as_ref().unwrap()["quota"], 3);
    }
}
