//! Error types for command execution and scheduling.

use std::any::Any;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::util::serde::WorkItemKey;

/// Failure of a single command (or of the processor running it).
///
/// The processor converts these into a boolean outcome plus a failure reason;
/// they never escape `CommandProcessor::execute`.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Target exists and the command was not allowed to overwrite it.
    #[error("already exists: {}", path.display())]
    AlreadyExists {
        /// Conflicting path.
        path: PathBuf,
    },
    /// A required source is missing.
    #[error("not found: {}", path.display())]
    NotFound {
        /// Missing path.
        path: PathBuf,
    },
    /// Filesystem failure with the operation that triggered it.
    #[error("{operation} failed on {}: {source}", path.display())]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Directory traversal failure.
    #[error("{operation} walk failed on {}: {source}", path.display())]
    Walkdir {
        /// Operation that triggered the traversal.
        operation: &'static str,
        /// Root of the traversal.
        path: PathBuf,
        /// Underlying walkdir error.
        source: walkdir::Error,
    },
    /// Catalogue lookup or update failed.
    #[error("persistence: {0}")]
    Persistence(String),
    /// A child of an aggregate failed; siblings were already undone.
    #[error("{command} failed inside {aggregate}: {reason}")]
    SubCommand {
        /// Aggregate name.
        aggregate: String,
        /// Failing child name.
        command: String,
        /// Child failure message.
        reason: String,
    },
    /// Cancellation was observed at a command boundary.
    #[error("cancelled before {0}")]
    Cancelled(String),
    /// `execute` was invoked a second time on the same processor.
    #[error("processor {0} already executed")]
    AlreadyExecuted(String),
    /// Command was built with inconsistent arguments.
    #[error("invalid command: {0}")]
    Invalid(String),
    /// The command panicked; the panic was contained at the command boundary.
    #[error("{command} panicked: {message}")]
    Panicked {
        /// Command that panicked.
        command: String,
        /// Panic payload rendered as text.
        message: String,
    },
}

impl CommandError {
    /// Wrap an IO error with its operation and path.
    pub fn io(operation: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap a walkdir error with its operation and root.
    pub fn walkdir(operation: &'static str, path: impl AsRef<Path>, source: walkdir::Error) -> Self {
        Self::Walkdir {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this failure came from a cancellation request.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

/// Errors produced by the scheduler, the stores it drives, and the service API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queue is at its configured maximum depth.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// No item with this key.
    #[error("work item not found: {0}")]
    ItemNotFound(WorkItemKey),
    /// Operation not allowed in the item's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The service has been shut down.
    #[error("service shut down")]
    Shutdown,
    /// Timed out waiting for an item to settle.
    #[error("timed out waiting for {0}")]
    Timeout(WorkItemKey),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
