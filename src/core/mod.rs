//! Command engine, work item model and dispatch.

pub mod audit;
pub mod cancel;
pub mod command;
pub mod context;
pub mod error;
pub mod item_processor;
pub mod resource_lock;
pub mod scheduler;
pub mod throttle;
pub mod work_item;
pub mod worker_pool;

pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, NullAuditSink, SharedAuditSink};
pub use cancel::CancellationToken;
pub use command::{AggregateCommand, Command, CommandProcessor, ProcessorContext, Rollback};
pub use context::ServerProcessorContext;
pub use error::{AppResult, CommandError, SchedulerError};
pub use item_processor::{
    Admission, FailureType, ItemContext, ItemFailure, ItemProcessor, ProcessResult, ProcessorRegistry,
    ProcessorServices,
};
pub use resource_lock::{InMemoryResourceLocks, ResourceLockGuard, ResourceLockTable};
pub use scheduler::{DispatchOutcome, Scheduler};
pub use throttle::ThrottleCache;
pub use work_item::{WorkItemStatus, WorkItemType, WorkItemUnit, WorkQueueItem};
pub use worker_pool::{PoolStats, WorkerPool};
