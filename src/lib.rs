//! # PACS Work Queue
//!
//! Background processing for a medical-image archive: a transactional command
//! engine and the work-queue scheduler that drives it.
//!
//! ## Command engine
//!
//! Mutations of the archive (moving received files into a study folder,
//! deleting a study, migrating it to another storage tier, updating its
//! catalogue row) are expressed as [`core::command::Command`]s and run by a
//! [`core::command::CommandProcessor`] as a local saga: commands execute in
//! order and, on the first failure, every executed command is undone in
//! reverse before the catalogue transaction is rolled back.
//!
//! ## Work queue
//!
//! Producers enqueue [`core::work_item::WorkQueueItem`]s through
//! [`runtime::WorkQueueService`]. Worker threads claim due items in priority
//! order, take an exclusive lock on the study the item works on, and hand the
//! item to the [`core::item_processor::ItemProcessor`] registered for its
//! type. Retries, postponement, throttling of outbound transfers and operator
//! cancellation are handled by the [`core::scheduler::Scheduler`].
//!
//! ```rust,ignore
//! use pacs_workqueue::builders::WorkQueueServiceBuilder;
//! use pacs_workqueue::config::WorkQueueConfig;
//! use pacs_workqueue::core::WorkItemType;
//! use pacs_workqueue::runtime::EnqueueRequest;
//!
//! let service = WorkQueueServiceBuilder::new(WorkQueueConfig::from_env()?)
//!     .with_catalogue(catalogue)
//!     .build()?;
//! service.start()?;
//!
//! let key = service.enqueue(
//!     EnqueueRequest::new(WorkItemType::DeleteStudy, "study-42"),
//! )?;
//! let item = service.wait_for_settled_async(&key, Duration::from_secs(30)).await?;
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Command engine, work item model and dispatch.
pub mod core;
/// Configuration for the work queue, retry policy and throttling.
pub mod config;
/// Builders to assemble the service from configuration.
pub mod builders;
/// Catalogue, work queue and transport adapters.
pub mod infra;
/// Built-in item processors.
pub mod processors;
/// Service surface for producers and operators.
pub mod runtime;
/// Shared utilities.
pub mod util;
