//! Producer and operator facing service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::WorkQueueConfig;
use crate::core::audit::{build_audit_event, SharedAuditSink};
use crate::core::error::SchedulerError;
use crate::core::item_processor::ProcessorServices;
use crate::core::scheduler::{DispatchOutcome, Scheduler};
use crate::core::work_item::{WorkItemStatus, WorkItemType, WorkItemUnit, WorkQueueItem};
use crate::core::worker_pool::{PoolStats, WorkerPool};
use crate::util::clock::duration_ms;
use crate::util::serde::{Priority, ResourceKey, WorkItemKey};

const SETTLE_POLL: Duration = Duration::from_millis(25);

/// New work for the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Type tag.
    pub item_type: WorkItemType,
    /// Study storage key the item works on.
    pub resource_key: ResourceKey,
    /// Earliest pickup (ms since epoch); now when absent.
    #[serde(default)]
    pub scheduled_ms: Option<u64>,
    /// How long after `scheduled_ms` the item may stay Idle; the type's
    /// expire delay when absent.
    #[serde(default)]
    pub expiration: Option<Duration>,
    /// Dispatch priority.
    #[serde(default)]
    pub priority: Priority,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Sub-units.
    #[serde(default)]
    pub units: Vec<WorkItemUnit>,
}

impl EnqueueRequest {
    /// Request due now with default priority and no payload.
    pub fn new(item_type: WorkItemType, resource_key: impl Into<ResourceKey>) -> Self {
        Self {
            item_type,
            resource_key: resource_key.into(),
            scheduled_ms: None,
            expiration: None,
            priority: Priority::Normal,
            data: Value::Null,
            units: Vec::new(),
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the sub-units.
    #[must_use]
    pub fn with_units(mut self, units: Vec<WorkItemUnit>) -> Self {
        self.units = units;
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule for a later time.
    #[must_use]
    pub const fn scheduled_at(mut self, scheduled_ms: u64) -> Self {
        self.scheduled_ms = Some(scheduled_ms);
        self
    }

    /// Override the expiration window.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Workers are running.
    pub running: bool,
    /// Items in the table.
    pub queue_depth: usize,
    /// Items Pending or Idle.
    pub waiting: usize,
    /// Items Failed.
    pub failed: usize,
    /// Worker statistics when running.
    pub pool: Option<PoolStats>,
}

/// Work queue service: enqueue, inspect and steer items, run workers.
pub struct WorkQueueService {
    scheduler: Arc<Scheduler>,
    config: Arc<WorkQueueConfig>,
    audit: SharedAuditSink,
    pool: Mutex<Option<WorkerPool>>,
}

impl WorkQueueService {
    /// Assemble a service around a scheduler.
    pub fn new(scheduler: Arc<Scheduler>, audit: SharedAuditSink) -> Self {
        let config = Arc::clone(&scheduler.services().config);
        Self {
            scheduler,
            config,
            audit,
            pool: Mutex::new(None),
        }
    }

    fn services(&self) -> &ProcessorServices {
        self.scheduler.services()
    }

    /// Underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Insert a new Pending item and wake a worker.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueFull`] at max depth, or backend failures.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<WorkItemKey, SchedulerError> {
        let now = self.services().clock.now_ms();
        let scheduled = request.scheduled_ms.unwrap_or(now);
        let window = request
            .expiration
            .unwrap_or_else(|| Duration::from_secs(self.config.properties(request.item_type).expire_delay_secs));
        let item = WorkQueueItem::new(
            request.item_type,
            request.resource_key,
            scheduled,
            scheduled.saturating_add(duration_ms(window)),
            request.priority,
            now,
        )
        .with_data(request.data)
        .with_units(request.units);
        let key = item.key;

        self.services().queue.insert(item.clone())?;
        self.audit.lock().record(build_audit_event(&item, "enqueue", None));
        debug!(item = %key, item_type = %item.item_type, resource = %item.resource_key, "work item enqueued");
        self.notify();
        Ok(key)
    }

    /// Current state of an item.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ItemNotFound`].
    pub fn item_status(&self, key: &WorkItemKey) -> Result<WorkQueueItem, SchedulerError> {
        self.services().queue.get(key)?.ok_or(SchedulerError::ItemNotFound(*key))
    }

    /// Ask the item's current or next pass to stop at a safe point.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::request_cancel`].
    pub fn request_cancel(&self, key: &WorkItemKey) -> Result<WorkQueueItem, SchedulerError> {
        self.scheduler.request_cancel(key)
    }

    /// Move an item's pickup time to `at_ms`. A Failed item is revived with a
    /// fresh retry budget.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidState`] for InProgress or Complete items,
    /// [`SchedulerError::ItemNotFound`].
    pub fn reschedule(&self, key: &WorkItemKey, at_ms: u64) -> Result<WorkQueueItem, SchedulerError> {
        let now = self.services().clock.now_ms();
        let item = self.services().queue.modify(key, &mut |item: &mut WorkQueueItem| {
            match item.status {
                WorkItemStatus::InProgress | WorkItemStatus::Complete => {
                    return Err(SchedulerError::InvalidState(format!(
                        "cannot reschedule {} while {:?}",
                        item.key, item.status
                    )));
                }
                WorkItemStatus::Failed => {
                    item.failure_count = 0;
                    item.failure_description = None;
                }
                WorkItemStatus::Pending | WorkItemStatus::Idle => {}
            }
            let window = item.expiration_ms.saturating_sub(item.scheduled_ms);
            item.status = WorkItemStatus::Pending;
            item.scheduled_ms = at_ms;
            item.expiration_ms = at_ms.saturating_add(window);
            item.last_updated_ms = now;
            Ok(())
        })?;
        self.audit
            .lock()
            .record(build_audit_event(&item, "reschedule", Some(format!("at {at_ms}"))));
        self.notify();
        Ok(item)
    }

    /// Delete Complete and Failed items not updated within `older_than`.
    /// Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub fn purge_terminal(&self, older_than: Duration) -> Result<usize, SchedulerError> {
        self.scheduler.purge_terminal(older_than)
    }

    /// Items in `status`, or every item.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub fn list(&self, status: Option<WorkItemStatus>) -> Result<Vec<WorkQueueItem>, SchedulerError> {
        self.services()
            .queue
            .list(&|item: &WorkQueueItem| status.is_none_or(|s| item.status == s))
    }

    /// Run one dispatch pass on the calling thread.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::run_once`].
    pub fn dispatch_once(&self, worker_id: &str) -> Result<DispatchOutcome, SchedulerError> {
        self.scheduler.run_once(worker_id)
    }

    /// Reset orphaned items and start the worker threads.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidState`] when already running, spawn or
    /// backend failures.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Err(SchedulerError::InvalidState("work queue already started".into()));
        }
        self.scheduler.reset_orphaned_items()?;
        *pool = Some(WorkerPool::start(Arc::clone(&self.scheduler), &self.config)?);
        info!(workers = self.config.worker_count, "work queue service started");
        Ok(())
    }

    /// Stop the workers. In-flight passes observe cancellation at their next
    /// command boundary.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown();
        }
    }

    /// Whether workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pool.lock().is_some()
    }

    fn notify(&self) {
        if let Some(pool) = self.pool.lock().as_ref() {
            pool.notify();
        }
    }

    /// Health summary.
    #[must_use]
    pub fn health(&self) -> Health {
        let queue = &self.services().queue;
        let counts = queue.list(&|_: &WorkQueueItem| true).map(|items| {
            let waiting = items
                .iter()
                .filter(|i| matches!(i.status, WorkItemStatus::Pending | WorkItemStatus::Idle))
                .count();
            let failed = items.iter().filter(|i| i.status == WorkItemStatus::Failed).count();
            (items.len(), waiting, failed)
        });
        let pool = self.pool.lock().as_ref().map(WorkerPool::stats);
        match counts {
            Ok((queue_depth, waiting, failed)) => Health {
                ok: true,
                running: pool.is_some(),
                queue_depth,
                waiting,
                failed,
                pool,
            },
            Err(_) => Health {
                ok: false,
                running: pool.is_some(),
                queue_depth: queue.len(),
                waiting: 0,
                failed: 0,
                pool,
            },
        }
    }

    /// Block until the item is Complete or Failed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Timeout`], [`SchedulerError::ItemNotFound`].
    pub fn wait_for_settled(&self, key: &WorkItemKey, timeout: Duration) -> Result<WorkQueueItem, SchedulerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let item = self.item_status(key)?;
            if item.status.is_terminal() {
                return Ok(item);
            }
            if Instant::now() >= deadline {
                return Err(SchedulerError::Timeout(*key));
            }
            std::thread::sleep(SETTLE_POLL);
        }
    }

    /// Async variant of [`wait_for_settled`](Self::wait_for_settled).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Timeout`], [`SchedulerError::ItemNotFound`].
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_for_settled_async(
        &self,
        key: &WorkItemKey,
        timeout: Duration,
    ) -> Result<WorkQueueItem, SchedulerError> {
        let settled = tokio::time::timeout(timeout, async {
            loop {
                let item = self.item_status(key)?;
                if item.status.is_terminal() {
                    return Ok::<_, SchedulerError>(item);
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        })
        .await;
        settled.unwrap_or(Err(SchedulerError::Timeout(*key)))
    }
}

impl Drop for WorkQueueService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
