//! Service surface for producers and operators.

pub mod api;

pub use api::{EnqueueRequest, Health, WorkQueueService};
