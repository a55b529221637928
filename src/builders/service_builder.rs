//! Assemble a [`WorkQueueService`] from configuration and collaborators.
//!
//! Every collaborator has an in-memory default, so a bare builder yields a
//! working service suitable for tests and single-process deployments.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;

use crate::config::WorkQueueConfig;
use crate::core::audit::{InMemoryAuditSink, SharedAuditSink};
use crate::core::item_processor::{ItemProcessor, ProcessorRegistry, ProcessorServices};
use crate::core::resource_lock::{InMemoryResourceLocks, ResourceLockTable};
use crate::core::scheduler::Scheduler;
use crate::core::throttle::ThrottleCache;
use crate::core::work_item::WorkItemType;
use crate::core::AppResult;
use crate::infra::persistence::{InMemoryCatalogue, PersistentStore};
use crate::infra::queue::{FileWorkQueueStore, InMemoryWorkQueueStore, WorkQueueStore};
use crate::infra::transport::{ConnectionMonitor, DirectoryTransport, Transport};
use crate::processors::register_default_processors;
use crate::runtime::WorkQueueService;
use crate::util::clock::{SharedClock, SystemClock};

const DEFAULT_AUDIT_EVENTS: usize = 10_000;
const QUEUE_STREAM: &str = "work_queue";

/// Builder for [`WorkQueueService`].
pub struct WorkQueueServiceBuilder {
    config: WorkQueueConfig,
    catalogue: Option<Arc<dyn PersistentStore>>,
    queue: Option<Arc<dyn WorkQueueStore>>,
    queue_dir: Option<PathBuf>,
    transport: Option<Arc<dyn Transport>>,
    connections: Option<Arc<dyn ConnectionMonitor>>,
    locks: Option<Arc<dyn ResourceLockTable>>,
    audit: Option<SharedAuditSink>,
    clock: Option<SharedClock>,
    registry: ProcessorRegistry,
}

impl WorkQueueServiceBuilder {
    /// Builder with the built-in processors registered.
    #[must_use]
    pub fn new(config: WorkQueueConfig) -> Self {
        let mut registry = ProcessorRegistry::new();
        register_default_processors(&mut registry);
        Self {
            config,
            catalogue: None,
            queue: None,
            queue_dir: None,
            transport: None,
            connections: None,
            locks: None,
            audit: None,
            clock: None,
            registry,
        }
    }

    /// Catalogue backend.
    #[must_use]
    pub fn with_catalogue(mut self, catalogue: Arc<dyn PersistentStore>) -> Self {
        self.catalogue = Some(catalogue);
        self
    }

    /// Work queue backend.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn WorkQueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Persist the work queue as JSON lines under `dir`.
    #[must_use]
    pub fn with_queue_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.queue_dir = Some(dir.into());
        self
    }

    /// Transport that also reports its own association counts.
    #[must_use]
    pub fn with_transport<T>(mut self, transport: Arc<T>) -> Self
    where
        T: Transport + ConnectionMonitor + 'static,
    {
        self.connections = Some(Arc::clone(&transport) as Arc<dyn ConnectionMonitor>);
        self.transport = Some(transport);
        self
    }

    /// Separate source of association counts.
    #[must_use]
    pub fn with_connection_monitor(mut self, connections: Arc<dyn ConnectionMonitor>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Resource lock table.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn ResourceLockTable>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Time source.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register (or replace) the processor for `item_type`.
    #[must_use]
    pub fn with_processor<F, P>(mut self, item_type: WorkItemType, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ItemProcessor + 'static,
    {
        self.registry.register(item_type, factory);
        self
    }

    /// Validate the configuration and wire everything together. Workers are
    /// not started; call [`WorkQueueService::start`].
    ///
    /// # Errors
    ///
    /// Invalid configuration or a queue file that cannot be opened.
    pub fn build(self) -> AppResult<WorkQueueService> {
        self.config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("invalid work queue configuration")?;

        let queue: Arc<dyn WorkQueueStore> = match (self.queue, &self.queue_dir) {
            (Some(queue), _) => queue,
            (None, Some(dir)) => Arc::new(
                FileWorkQueueStore::open(dir, QUEUE_STREAM, self.config.max_queue_depth)
                    .with_context(|| format!("opening work queue in {}", dir.display()))?,
            ),
            (None, None) => Arc::new(InMemoryWorkQueueStore::new(self.config.max_queue_depth)),
        };

        let directory = Arc::new(DirectoryTransport::new());
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::clone(&directory) as Arc<dyn Transport>);
        let connections = self
            .connections
            .unwrap_or_else(|| directory as Arc<dyn ConnectionMonitor>);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(Mutex::new(InMemoryAuditSink::new(DEFAULT_AUDIT_EVENTS))));

        let services = ProcessorServices {
            catalogue: self.catalogue.unwrap_or_else(|| Arc::new(InMemoryCatalogue::new())),
            queue,
            throttle: Arc::new(ThrottleCache::new(Arc::clone(&clock))),
            transport,
            connections,
            clock,
            config: Arc::new(self.config),
        };
        let locks = self.locks.unwrap_or_else(|| Arc::new(InMemoryResourceLocks::new()));
        let scheduler = Scheduler::new(Arc::new(services), Arc::new(self.registry), locks, Arc::clone(&audit));
        Ok(WorkQueueService::new(Arc::new(scheduler), audit))
    }
}
