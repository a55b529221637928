//! Per-type work item handlers and the registry that resolves them.
//!
//! The scheduler drives every handler through the same sequence:
//! `initialize`, `can_start`, `process_item`, then `post_processing` with the
//! status the item ended up in.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{WorkQueueConfig, WorkQueueTypeProperties};
use crate::core::cancel::CancellationToken;
use crate::core::command::{CommandProcessor, ProcessorContext};
use crate::core::context::ServerProcessorContext;
use crate::core::error::CommandError;
use crate::core::throttle::ThrottleCache;
use crate::core::work_item::{WorkItemStatus, WorkItemType, WorkQueueItem};
use crate::infra::persistence::{PersistenceError, PersistentStore};
use crate::infra::queue::WorkQueueStore;
use crate::infra::transport::{ConnectionMonitor, Transport};
use crate::util::clock::SharedClock;

/// Answer of `can_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed to `process_item`.
    Go,
    /// Do no work now; try again after `delay` (the type's postpone delay
    /// when `None`).
    Postpone {
        /// Persisted on the item.
        reason: String,
        /// Override of the type's postpone delay.
        delay: Option<Duration>,
    },
}

impl Admission {
    /// Postpone with the type's default delay.
    pub fn postpone(reason: impl Into<String>) -> Self {
        Self::Postpone {
            reason: reason.into(),
            delay: None,
        }
    }
}

/// Successful outcome of `process_item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Nothing left to do.
    Complete,
    /// Processed everything available; more may arrive before expiration.
    Idle,
    /// More work is ready right away.
    Pending,
    /// Cancellation observed at a safe point; nothing half-committed.
    Cancelled,
}

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Retrying cannot help.
    Fatal,
    /// Retry with backoff.
    NonFatal,
}

/// Classified item failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Classification.
    pub kind: FailureType,
    /// Persisted as the item's failure description.
    pub reason: String,
}

impl ItemFailure {
    /// Fatal failure.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureType::Fatal,
            reason: reason.into(),
        }
    }

    /// Retryable failure.
    pub fn non_fatal(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureType::NonFatal,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

impl From<PersistenceError> for ItemFailure {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Missing { .. } | PersistenceError::Malformed { .. } => Self::fatal(err.to_string()),
            PersistenceError::Duplicate { .. } | PersistenceError::Closed => Self::non_fatal(err.to_string()),
        }
    }
}

/// Collaborators available to every item processor.
pub struct ProcessorServices {
    /// Catalogue.
    pub catalogue: Arc<dyn PersistentStore>,
    /// Work queue table.
    pub queue: Arc<dyn WorkQueueStore>,
    /// Destination blackout cache.
    pub throttle: Arc<ThrottleCache>,
    /// Outbound transfers.
    pub transport: Arc<dyn Transport>,
    /// Live association counts.
    pub connections: Arc<dyn ConnectionMonitor>,
    /// Time source.
    pub clock: SharedClock,
    /// Service configuration.
    pub config: Arc<WorkQueueConfig>,
}

impl ProcessorServices {
    /// Processor context with a fresh catalogue transaction.
    #[must_use]
    pub fn processor_context(&self, name: &str) -> ServerProcessorContext {
        ServerProcessorContext::new(name, &self.config.scratch_directory)
            .with_update_context(self.catalogue.open_update_context())
    }
}

/// Everything a handler sees for one pass over one item.
pub struct ItemContext<'a> {
    /// Item being processed; handlers may edit units and payload.
    pub item: &'a mut WorkQueueItem,
    /// Tripped when an operator cancels or the pool shuts down.
    pub cancel: &'a CancellationToken,
    /// Shared collaborators.
    pub services: &'a ProcessorServices,
    /// Properties of this item's type.
    pub properties: &'a WorkQueueTypeProperties,
    /// Time the pass started.
    pub now_ms: u64,
}

impl ItemContext<'_> {
    /// Run `processor` and translate its outcome. `Ok(false)` means the run
    /// stopped because cancellation was observed at a command boundary.
    ///
    /// # Errors
    ///
    /// A NonFatal [`ItemFailure`] carrying the processor's failure reason.
    pub fn run<C: ProcessorContext>(&self, processor: &mut CommandProcessor<C>) -> Result<bool, ItemFailure> {
        if processor.execute() {
            return Ok(true);
        }
        if processor.failure().is_some_and(CommandError::is_cancelled) {
            return Ok(false);
        }
        Err(ItemFailure::non_fatal(
            processor
                .failure_reason()
                .unwrap_or("command processor failed")
                .to_owned(),
        ))
    }
}

/// Per-type handler.
pub trait ItemProcessor: Send {
    /// Load whatever `process_item` needs. A failure fails the item.
    ///
    /// # Errors
    ///
    /// Any [`ItemFailure`]; the item is Failed regardless of its kind.
    fn initialize(&mut self, ctx: &mut ItemContext<'_>) -> Result<(), ItemFailure>;

    /// Admission control. Runs after `initialize`.
    fn can_start(&mut self, _ctx: &mut ItemContext<'_>) -> Admission {
        Admission::Go
    }

    /// Do the work, normally through one or more command processors.
    ///
    /// # Errors
    ///
    /// A classified [`ItemFailure`].
    fn process_item(&mut self, ctx: &mut ItemContext<'_>) -> Result<ProcessResult, ItemFailure>;

    /// Called with the status the item was left in.
    fn post_processing(&mut self, _item: &WorkQueueItem, _status: WorkItemStatus) {}
}

/// Factory producing a fresh handler per pass.
pub type ProcessorFactory = Box<dyn Fn() -> Box<dyn ItemProcessor> + Send + Sync>;

/// Maps item types to handler factories.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: HashMap<WorkItemType, ProcessorFactory>,
}

impl ProcessorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `item_type`.
    pub fn register<F, P>(&mut self, item_type: WorkItemType, factory: F)
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ItemProcessor + 'static,
    {
        self.factories
            .insert(item_type, Box::new(move || Box::new(factory()) as Box<dyn ItemProcessor>));
    }

    /// New handler for `item_type`, if one is registered.
    #[must_use]
    pub fn resolve(&self, item_type: WorkItemType) -> Option<Box<dyn ItemProcessor>> {
        self.factories.get(&item_type).map(|factory| factory())
    }

    /// Whether `item_type` has a handler.
    #[must_use]
    pub fn contains(&self, item_type: WorkItemType) -> bool {
        self.factories.contains_key(&item_type)
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl ItemProcessor for Noop {
        fn initialize(&mut self, _ctx: &mut ItemContext<'_>) -> Result<(), ItemFailure> {
            Ok(())
        }

        fn process_item(&mut self, _ctx: &mut ItemContext<'_>) -> Result<ProcessResult, ItemFailure> {
            Ok(ProcessResult::Complete)
        }
    }

    #[test]
    fn registry_resolves_registered_types_only() {
        let mut registry = ProcessorRegistry::new();
        registry.register(WorkItemType::DeleteStudy, || Noop);
        assert!(registry.contains(WorkItemType::DeleteStudy));
        assert!(registry.resolve(WorkItemType::DeleteStudy).is_some());
        assert!(registry.resolve(WorkItemType::AutoRoute).is_none());
    }

    #[test]
    fn missing_catalogue_rows_are_fatal() {
        let failure = ItemFailure::from(PersistenceError::Missing {
            table: "study_storage".into(),
            key: "s".into(),
        });
        assert_eq!(failure.kind, FailureType::Fatal);
        assert_eq!(ItemFailure::from(PersistenceError::Closed).kind, FailureType::NonFatal);
    }
}
