//! Builders that wire the service together from configuration.

pub mod service_builder;

pub use service_builder::WorkQueueServiceBuilder;
