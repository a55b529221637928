//! Audit trail of work item transitions.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::work_item::{WorkItemType, WorkQueueItem};
use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related work item.
    pub item_key: String,
    /// Work item type.
    pub item_type: WorkItemType,
    /// Resource (study) the item works on.
    pub resource: String,
    /// Action taken (enqueue, claim, postpone, contention, complete, idle, retry, fail, cancel, reset).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u64,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Audit sink shared between workers.
pub type SharedAuditSink = Arc<Mutex<dyn AuditSink>>;

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Actions recorded for one item, oldest first.
    #[must_use]
    pub fn actions_for(&self, item_key: &str) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.item_key == item_key)
            .map(|e| e.action.clone())
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&mut self, _event: AuditEvent) {}
}

/// Helper to build an audit event for a work item.
pub fn build_audit_event(item: &WorkQueueItem, action: impl Into<String>, detail: Option<String>) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        item_key: item.key.to_string(),
        item_type: item.item_type,
        resource: item.resource_key.to_string(),
        action: action.into(),
        created_at_ms: now_ms(),
        detail,
    }
}
