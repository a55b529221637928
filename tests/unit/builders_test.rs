//! Tests for builder modules

use pacs_workqueue::builders::WorkQueueServiceBuilder;
use pacs_workqueue::config::WorkQueueConfig;
use pacs_workqueue::core::{ProcessorRegistry, WorkItemStatus, WorkItemType};
use pacs_workqueue::processors::register_default_processors;
use pacs_workqueue::runtime::EnqueueRequest;

#[test]
fn test_default_processors_cover_every_type() {
    let mut registry = ProcessorRegistry::new();
    register_default_processors(&mut registry);
    for item_type in WorkItemType::ALL {
        assert!(registry.contains(item_type), "{item_type} not registered");
    }
}

#[test]
fn test_builder_defaults_produce_working_service() {
    let service = WorkQueueServiceBuilder::new(WorkQueueConfig::default().with_worker_count(1))
        .build()
        .unwrap();
    assert!(service.health().ok);
    assert!(!service.is_running());

    let key = service
        .enqueue(EnqueueRequest::new(WorkItemType::DeleteStudy, "absent"))
        .unwrap();
    service.dispatch_once("builder-test").unwrap();
    // No catalogue row for the study.
    assert_eq!(service.item_status(&key).unwrap().status, WorkItemStatus::Failed);
}

#[test]
fn test_file_queue_survives_rebuild() {
    let dir = tempfile::TempDir::new().unwrap();
    let key = {
        let service = WorkQueueServiceBuilder::new(WorkQueueConfig::default())
            .with_queue_dir(dir.path())
            .build()
            .unwrap();
        service
            .enqueue(EnqueueRequest::new(WorkItemType::TierMigrate, "study-3"))
            .unwrap()
    };

    let service = WorkQueueServiceBuilder::new(WorkQueueConfig::default())
        .with_queue_dir(dir.path())
        .build()
        .unwrap();
    let item = service.item_status(&key).unwrap();
    assert_eq!(item.item_type, WorkItemType::TierMigrate);
    assert_eq!(item.status, WorkItemStatus::Pending);
}
