//! Configuration models for the work queue, retry policy and throttling.

pub mod work_queue;

pub use work_queue::{ThrottleConfig, WorkQueueConfig, WorkQueueTypeProperties, ENV_PREFIX};
