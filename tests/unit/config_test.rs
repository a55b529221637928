//! Tests for configuration parsing and validation

use std::time::Duration;

use pacs_workqueue::config::{WorkQueueConfig, WorkQueueTypeProperties};
use pacs_workqueue::core::WorkItemType;

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

#[test]
fn test_default_config_is_valid() {
    let config = WorkQueueConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.worker_count >= 1);
    assert_eq!(config.query_delay(), Duration::from_millis(1_000));
}

#[test]
fn test_invalid_queue_depth() {
    let mut config = WorkQueueConfig::default();
    config.max_queue_depth = 0;
    assert!(config.validate().unwrap_err().contains("max_queue_depth"));
}

#[test]
fn test_invalid_type_override_names_the_type() {
    let config = WorkQueueConfig::default().with_type_properties(
        WorkItemType::TierMigrate,
        WorkQueueTypeProperties {
            max_batch_size: 0,
            ..WorkQueueTypeProperties::default()
        },
    );
    let err = config.validate().unwrap_err();
    assert!(err.contains("tier_migrate"), "{err}");
}

#[test]
fn test_backoff_must_cover_failure_delay() {
    let props = WorkQueueTypeProperties {
        failure_delay_secs: 60,
        max_backoff_secs: 30,
        ..WorkQueueTypeProperties::default()
    };
    assert!(props.validate().is_err());
}

#[test]
fn test_from_json() {
    let json = r#"{
        "worker_count": 4,
        "throttle": { "max_connections_per_destination": 1 },
        "types": {
            "study_process": { "max_batch_size": 50 }
        }
    }"#;

    let config = WorkQueueConfig::from_json_str(json).unwrap();
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.throttle.max_connections_per_destination, 1);
    assert_eq!(config.throttle.blackout_secs, 5);
    assert_eq!(config.properties(WorkItemType::StudyProcess).max_batch_size, 50);
    assert_eq!(config.properties(WorkItemType::AutoRoute).max_batch_size, 1_000);
}

#[test]
fn test_from_json_rejects_garbage() {
    let err = WorkQueueConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_from_vars_overrides_defaults() {
    let config = WorkQueueConfig::from_vars(vars(&[
        ("PACS_WQ_WORKER_COUNT", "3"),
        ("PACS_WQ_MAX_FAILURE_COUNT", " 7 "),
        ("PACS_WQ_SCRATCH_DIRECTORY", "/var/tmp/wq"),
        ("PACS_WQ_SOMETHING_ELSE", "ignored"),
        ("PATH", "/usr/bin"),
    ]))
    .unwrap();

    assert_eq!(config.worker_count, 3);
    assert_eq!(config.default_properties.max_failure_count, 7);
    assert_eq!(config.scratch_directory, std::path::PathBuf::from("/var/tmp/wq"));
}

#[test]
fn test_from_vars_reports_bad_numbers() {
    let err = WorkQueueConfig::from_vars(vars(&[("PACS_WQ_QUERY_DELAY_MS", "soon")])).unwrap_err();
    assert!(err.contains("PACS_WQ_QUERY_DELAY_MS"), "{err}");
}

#[test]
fn test_from_vars_validates_result() {
    assert!(WorkQueueConfig::from_vars(vars(&[("PACS_WQ_WORKER_COUNT", "0")])).is_err());
}
