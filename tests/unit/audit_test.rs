//! Tests for audit sink

use pacs_workqueue::core::{build_audit_event, AuditSink, InMemoryAuditSink, WorkItemType, WorkQueueItem};
use pacs_workqueue::util::{Priority, ResourceKey};

fn item(resource: &str) -> WorkQueueItem {
    WorkQueueItem::new(
        WorkItemType::AutoRoute,
        ResourceKey::from(resource),
        1_000,
        2_000,
        Priority::Normal,
        1_000,
    )
}

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let item = item("study-1");

    sink.record(build_audit_event(&item, "enqueue", None));
    sink.record(build_audit_event(&item, "claim", Some("worker wq-worker-0".to_string())));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].item_key, item.key.to_string());
    assert_eq!(events[0].item_type, WorkItemType::AutoRoute);
    assert_eq!(events[0].resource, "study-1");
    assert_eq!(events[1].detail.as_deref(), Some("worker wq-worker-0"));
    assert_eq!(sink.actions_for(&item.key.to_string()), vec!["enqueue", "claim"]);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);
    let item = item("study-1");

    sink.record(build_audit_event(&item, "enqueue", None));
    sink.record(build_audit_event(&item, "claim", None));
    sink.record(build_audit_event(&item, "complete", None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].action, "claim"); // First one popped
    assert_eq!(events[1].action, "complete");
}

#[test]
fn test_actions_are_filtered_per_item() {
    let mut sink = InMemoryAuditSink::new(10);
    let first = item("a");
    let second = item("b");

    sink.record(build_audit_event(&first, "enqueue", None));
    sink.record(build_audit_event(&second, "enqueue", None));
    sink.record(build_audit_event(&second, "fail", Some("destination unknown".into())));

    assert_eq!(sink.actions_for(&first.key.to_string()), vec!["enqueue"]);
    assert_eq!(sink.actions_for(&second.key.to_string()), vec!["enqueue", "fail"]);
    assert_ne!(sink.events()[0].event_id, sink.events()[1].event_id);
}
