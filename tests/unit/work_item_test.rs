//! Tests for the work item model

use pacs_workqueue::core::{WorkItemStatus, WorkItemType, WorkItemUnit, WorkQueueItem};
use pacs_workqueue::util::{Priority, ResourceKey};

fn item_with_units(count: usize) -> WorkQueueItem {
    let units = (0..count)
        .map(|i| WorkItemUnit::new(format!("1.2.{i}"), format!("{i}.dcm")))
        .collect();
    WorkQueueItem::new(
        WorkItemType::StudyProcess,
        ResourceKey::from("study"),
        100,
        50,
        Priority::High,
        100,
    )
    .with_units(units)
}

#[test]
fn test_new_item_is_pending_with_sane_window() {
    let item = item_with_units(0);
    assert_eq!(item.status, WorkItemStatus::Pending);
    assert_eq!(item.expiration_ms, 100);
    assert!(item.is_due(100));
    assert!(!item.is_due(99));
}

#[test]
fn test_batch_skips_failed_units() {
    let mut item = item_with_units(3);
    assert!(item.fail_unit("1.2.0", 1));
    let batch = item.batch(5);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].uid, "1.2.1");
    assert_eq!(item.batch(1).len(), 1);
}

#[test]
fn test_unit_failures_accumulate() {
    let mut item = item_with_units(1);
    assert!(!item.fail_unit("1.2.0", 3));
    assert!(!item.fail_unit("1.2.0", 3));
    assert!(item.fail_unit("1.2.0", 3));
    assert_eq!(item.remaining_units().count(), 0);
    assert!(!item.fail_unit("missing", 1));
}

#[test]
fn test_complete_unit_removes_it() {
    let mut item = item_with_units(2);
    item.complete_unit("1.2.1");
    assert_eq!(item.units.len(), 1);
    assert_eq!(item.units[0].uid, "1.2.0");
}

#[test]
fn test_item_type_names() {
    assert_eq!(WorkItemType::AutoRoute.to_string(), "auto_route");
    let parsed: WorkItemType = serde_json::from_str("\"tier_migrate\"").unwrap();
    assert_eq!(parsed, WorkItemType::TierMigrate);
}
