//! Tests for error types

use std::io;
use std::path::PathBuf;

use pacs_workqueue::core::{CommandError, SchedulerError};

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("100 items".to_string());
    assert_eq!(format!("{}", err), "queue full: 100 items");
}

#[test]
fn test_invalid_state_error() {
    let err = SchedulerError::InvalidState("item is in progress".to_string());
    assert_eq!(format!("{}", err), "invalid state: item is in progress");
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("disk full".to_string());
    assert_eq!(format!("{}", err), "backend error: disk full");
}

#[test]
fn test_already_exists_error() {
    let err = CommandError::AlreadyExists {
        path: PathBuf::from("/studies/1/a.dcm"),
    };
    assert_eq!(format!("{}", err), "already exists: /studies/1/a.dcm");
}

#[test]
fn test_io_error_keeps_operation_and_path() {
    let err = CommandError::io("rename", "/studies/1", io::Error::other("busy"));
    let text = err.to_string();
    assert!(text.starts_with("rename failed on /studies/1"), "{text}");
    assert!(text.ends_with("busy"));
}

#[test]
fn test_cancelled_error() {
    let err = CommandError::Cancelled("save_file".to_string());
    assert!(err.is_cancelled());
    assert_eq!(format!("{}", err), "cancelled before save_file");
    assert!(!CommandError::Persistence("x".into()).is_cancelled());
}
