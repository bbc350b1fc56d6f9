//! Audit sinks and the audit capability.

use super::{AuditEvent, AuditHandler, EntityRef, TraceContext};
use crate::ids::SharedIdGenerator;
use crate::Result;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives one validated audit event per call.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Consume an event.
    async fn emit(&self, event: &AuditEvent) -> Result<()>;
}

/// Shared sink handle.
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all collected events, in emission order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events belonging to one evaluation.
    pub fn events_for(&self, evaluation_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.evaluation_id == evaluation_id)
            .cloned()
            .collect()
    }

    /// Number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events were collected.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop all collected events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        info!(
            target: "policy_engine::audit",
            event_id = %event.id,
            event_type = %event.event_type,
            evaluation_id = %event.evaluation_id,
            policy = %event.policy.name,
            rule = event.rule.as_ref().map(|r| r.name.as_str()).unwrap_or(""),
            outcome = event.decision.as_ref().map(|d| d.outcome.as_str()).unwrap_or(""),
            parent_id = event.parent_id.as_deref().unwrap_or(""),
            "{}",
            event.summary()
        );
        Ok(())
    }
}

/// Sink wrapping a synchronous closure.
pub struct FnAuditSink<F> {
    f: F,
}

impl<F> FnAuditSink<F>
where
    F: Fn(&AuditEvent) -> Result<()> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> AuditSink for FnAuditSink<F>
where
    F: Fn(&AuditEvent) -> Result<()> + Send + Sync,
{
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        (self.f)(event)
    }
}

/// The audit capability: a list of sinks shared by every evaluation that
/// runs against the context it is attached to.
#[derive(Clone, Default)]
pub struct Audit {
    sinks: Vec<SharedAuditSink>,
}

impl Audit {
    /// Create an audit capability without sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink.
    pub fn with_sink(mut self, sink: SharedAuditSink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver an event to every sink. A failing sink does not stop delivery
    /// to the others.
    pub async fn publish(&self, event: &AuditEvent) {
        for (index, sink) in self.sinks.iter().enumerate() {
            if let Err(e) = sink.emit(event).await {
                warn!(
                    sink = index,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Audit sink failed"
                );
            }
        }
    }

    /// Open a handler for one evaluation.
    pub fn open(
        &self,
        policy: EntityRef,
        evaluation_id: impl Into<String>,
        trace: Option<TraceContext>,
        ids: SharedIdGenerator,
    ) -> AuditHandler {
        AuditHandler::new(self.clone(), policy, evaluation_id.into(), trace, ids)
    }
}

impl std::fmt::Debug for Audit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Audit")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
