//! Service surface tests with running worker threads.

mod common;

use std::time::Duration;

use common::{Harness, START_MS};
use pacs_workqueue::core::{SchedulerError, WorkItemStatus, WorkItemType, WorkItemUnit};
use pacs_workqueue::runtime::EnqueueRequest;

#[tokio::test]
async fn workers_settle_enqueued_items() {
    let h = Harness::new();
    let study_dir = h.seed_study("study-1");
    std::fs::create_dir_all(&study_dir).unwrap();
    h.service.start().unwrap();
    assert!(h.service.is_running());

    let key = h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "study-1")).unwrap();
    let item = h
        .service
        .wait_for_settled_async(&key, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(item.status, WorkItemStatus::Complete);
    assert!(!study_dir.exists());
    let health = h.service.health();
    assert!(health.ok);
    assert!(health.running);
    assert_eq!(health.pool.map(|p| p.worker_count), Some(2));

    h.service.shutdown();
    assert!(!h.service.is_running());
}

#[tokio::test]
async fn waiting_on_an_unfinished_item_times_out() {
    let h = Harness::new();
    let key = h
        .service
        .enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "later").scheduled_at(START_MS + 3_600_000))
        .unwrap();
    let err = h
        .service
        .wait_for_settled_async(&key, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Timeout(k) if k == key));
}

#[test]
fn blocking_wait_with_many_items() {
    let h = Harness::new();
    let keys: Vec<_> = (0..8)
        .map(|i| {
            let study = format!("study-{i}");
            h.seed_study(&study);
            h.service
                .enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, study.as_str()))
                .unwrap()
        })
        .collect();
    h.service.start().unwrap();
    for key in &keys {
        let item = h.service.wait_for_settled(key, Duration::from_secs(10)).unwrap();
        assert_eq!(item.status, WorkItemStatus::Complete);
    }
    assert_eq!(h.locks.held_count(), 0);
    h.service.shutdown();
}

#[test]
fn start_twice_is_rejected() {
    let h = Harness::new();
    h.service.start().unwrap();
    assert!(matches!(h.service.start(), Err(SchedulerError::InvalidState(_))));
    h.service.shutdown();
}

#[test]
fn reschedule_rules() {
    let h = Harness::new();
    h.seed_study("s");
    let key = h
        .service
        .enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "s").scheduled_at(START_MS + 60_000))
        .unwrap();

    let moved = h.service.reschedule(&key, START_MS).unwrap();
    assert_eq!(moved.scheduled_ms, START_MS);
    assert_eq!(moved.expiration_ms, START_MS + 90_000);

    h.dispatch();
    assert!(matches!(
        h.service.reschedule(&key, START_MS),
        Err(SchedulerError::InvalidState(_))
    ));
    assert!(matches!(
        h.service.reschedule(&pacs_workqueue::util::serde::WorkItemKey::new(), START_MS),
        Err(SchedulerError::ItemNotFound(_))
    ));
}

#[test]
fn rescheduling_a_failed_item_resets_its_budget() {
    let h = Harness::new();
    let key = h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "ghost")).unwrap();
    h.dispatch();
    assert_eq!(h.service.item_status(&key).unwrap().status, WorkItemStatus::Failed);

    let revived = h.service.reschedule(&key, START_MS).unwrap();
    assert_eq!(revived.status, WorkItemStatus::Pending);
    assert_eq!(revived.failure_count, 0);
    assert_eq!(revived.failure_description, None);
}

#[test]
fn list_filters_by_status() {
    let h = Harness::new();
    h.seed_study("a");
    h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "a")).unwrap();
    h.service
        .enqueue(
            EnqueueRequest::new(WorkItemType::AutoRoute, "b")
                .scheduled_at(START_MS + 1_000)
                .with_units(vec![WorkItemUnit::new("1", "1.dcm")]),
        )
        .unwrap();
    h.dispatch();

    assert_eq!(h.service.list(None).unwrap().len(), 2);
    assert_eq!(h.service.list(Some(WorkItemStatus::Complete)).unwrap().len(), 1);
    assert_eq!(h.service.list(Some(WorkItemStatus::Pending)).unwrap().len(), 1);
    let health = h.service.health();
    assert_eq!(health.queue_depth, 2);
    assert_eq!(health.waiting, 1);
    assert!(!health.running);
}

#[test]
fn queue_depth_is_enforced() {
    let h = Harness::build(
        |mut c| {
            c.max_queue_depth = 1;
            c
        },
        |b| b,
    );
    h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "a")).unwrap();
    assert!(matches!(
        h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "b")),
        Err(SchedulerError::QueueFull(_))
    ));
}

#[test]
fn finished_items_free_queue_depth() {
    let h = Harness::build(
        |mut c| {
            c.max_queue_depth = 1;
            c
        },
        |b| b,
    );
    h.seed_study("a");
    let done = h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "a")).unwrap();
    h.dispatch();
    assert_eq!(h.service.item_status(&done).unwrap().status, WorkItemStatus::Complete);

    h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "b")).unwrap();
    assert_eq!(h.service.health().queue_depth, 2);
}

#[test]
fn purge_deletes_only_items_past_retention() {
    let h = Harness::new();
    h.seed_study("a");
    let done = h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "a")).unwrap();
    let waiting = h
        .service
        .enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "b").scheduled_at(START_MS + 86_400_000))
        .unwrap();
    h.dispatch();

    let hour = Duration::from_secs(3_600);
    assert_eq!(h.service.purge_terminal(hour).unwrap(), 0);
    h.advance(hour * 2);
    assert_eq!(h.service.purge_terminal(hour).unwrap(), 1);
    assert!(matches!(h.service.item_status(&done), Err(SchedulerError::ItemNotFound(_))));
    assert_eq!(h.service.item_status(&waiting).unwrap().status, WorkItemStatus::Pending);
}

#[test]
fn pool_housekeeping_purges_finished_items() {
    let h = Harness::build(
        |mut c| {
            c.terminal_retention_secs = 0;
            c.housekeeping_interval_ms = 20;
            c
        },
        |b| b,
    );
    h.seed_study("a");
    let key = h.service.enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "a")).unwrap();
    h.service.start().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !h.service.health().pool.is_some_and(|p| p.purged >= 1) {
        assert!(std::time::Instant::now() < deadline, "finished item was never purged");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(h.service.item_status(&key), Err(SchedulerError::ItemNotFound(_))));
    h.service.shutdown();
}
