//! Tests for utility functions

use std::time::Duration;

use pacs_workqueue::util::{duration_ms, Clock, ManualClock, Priority, ResourceKey, SystemClock, WorkItemKey};

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
}

#[test]
fn test_priority_serializes_snake_case() {
    assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"critical\"");
}

#[test]
fn test_resource_key() {
    let key = ResourceKey::from("study-9");
    assert_eq!(key.as_str(), "study-9");
    assert_eq!(key.to_string(), "study-9");
    assert_eq!(serde_json::to_string(&key).unwrap(), "\"study-9\"");
}

#[test]
fn test_work_item_keys_are_unique() {
    let a = WorkItemKey::new();
    let b = WorkItemKey::new();
    assert_ne!(a, b);
    let parsed: WorkItemKey = serde_json::from_str(&serde_json::to_string(&a).unwrap()).unwrap();
    assert_eq!(parsed, a);
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(5_000);
    let shared = clock.clone();
    shared.advance(Duration::from_millis(250));
    assert_eq!(clock.now_ms(), 5_250);
    clock.set(10);
    assert_eq!(shared.now_ms(), 10);
}

#[test]
fn test_system_clock_is_past_epoch() {
    assert!(SystemClock.now_ms() > 1_600_000_000_000);
    assert_eq!(duration_ms(Duration::from_secs(2)), 2_000);
}
