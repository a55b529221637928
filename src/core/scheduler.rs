//! Work item dispatch.
//!
//! One call to [`Scheduler::run_once`] is one pass of a worker: claim the best
//! due item, lock its study, run its handler, persist the resulting state and
//! release the lock. Handler errors and panics are contained here and never
//! leave the study locked.
//!
//! Claims also respect the pool's partitions: with priority workers
//! configured, Normal and Low items only take the general share of passes,
//! and memory-limited types never exceed their own slot count.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WorkQueueTypeProperties;
use crate::core::audit::{build_audit_event, SharedAuditSink};
use crate::core::cancel::CancellationToken;
use crate::core::error::{panic_message, SchedulerError};
use crate::core::item_processor::{
    Admission, FailureType, ItemContext, ItemFailure, ItemProcessor, ProcessResult, ProcessorRegistry,
    ProcessorServices,
};
use crate::core::resource_lock::{ResourceLockGuard, ResourceLockTable};
use crate::core::work_item::{WorkItemStatus, WorkQueueItem};
use crate::util::clock::duration_ms;
use crate::util::serde::{Priority, WorkItemKey};

/// What one pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was due.
    NoWork,
    /// The item's study was locked; the item went back to Pending.
    LockContention(WorkItemKey),
    /// `can_start` declined; the item was postponed.
    Postponed(WorkItemKey),
    /// The handler ran (or failed) and the item is now in `status`.
    Processed {
        /// Item processed.
        key: WorkItemKey,
        /// Status persisted for it.
        status: WorkItemStatus,
    },
}

enum Verdict {
    InitFailed(ItemFailure),
    Postponed { reason: String, delay: Option<Duration> },
    Done(ProcessResult),
    Failed(ItemFailure),
}

/// Dispatcher shared by all workers.
pub struct Scheduler {
    services: Arc<ProcessorServices>,
    registry: Arc<ProcessorRegistry>,
    locks: Arc<dyn ResourceLockTable>,
    audit: SharedAuditSink,
    in_flight: Mutex<HashMap<WorkItemKey, CancellationToken>>,
    slots: Mutex<SlotUsage>,
}

#[derive(Debug, Default)]
struct SlotUsage {
    general: usize,
    memory_limited: usize,
}

#[derive(Debug, Clone, Copy)]
struct SlotClass {
    general: bool,
    memory_limited: bool,
}

impl SlotUsage {
    fn take(&mut self, class: SlotClass) {
        self.general += usize::from(class.general);
        self.memory_limited += usize::from(class.memory_limited);
    }

    fn give_back(&mut self, class: SlotClass) {
        self.general = self.general.saturating_sub(usize::from(class.general));
        self.memory_limited = self.memory_limited.saturating_sub(usize::from(class.memory_limited));
    }
}

struct SlotGuard<'a> {
    usage: &'a Mutex<SlotUsage>,
    class: SlotClass,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.usage.lock().give_back(self.class);
    }
}

struct InFlight<'a> {
    map: &'a Mutex<HashMap<WorkItemKey, CancellationToken>>,
    key: WorkItemKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

fn after(now_ms: u64, d: Duration) -> u64 {
    now_ms.saturating_add(duration_ms(d))
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

impl Scheduler {
    /// Build a scheduler over shared services.
    pub fn new(
        services: Arc<ProcessorServices>,
        registry: Arc<ProcessorRegistry>,
        locks: Arc<dyn ResourceLockTable>,
        audit: SharedAuditSink,
    ) -> Self {
        Self {
            services,
            registry,
            locks,
            audit,
            in_flight: Mutex::new(HashMap::new()),
            slots: Mutex::new(SlotUsage::default()),
        }
    }

    /// Shared services.
    #[must_use]
    pub fn services(&self) -> &Arc<ProcessorServices> {
        &self.services
    }

    /// Lock table.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn ResourceLockTable> {
        &self.locks
    }

    /// Items currently being processed.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn record(&self, item: &WorkQueueItem, action: &str, detail: Option<String>) {
        self.audit.lock().record(build_audit_event(item, action, detail));
    }

    /// Run one dispatch pass on behalf of `worker_id`.
    ///
    /// # Errors
    ///
    /// Only work queue backend failures; handler failures are applied to the
    /// item.
    pub fn run_once(&self, worker_id: &str) -> Result<DispatchOutcome, SchedulerError> {
        let now = self.services.clock.now_ms();
        let Some((mut item, _slot)) = self.claim(worker_id, now)? else {
            return Ok(DispatchOutcome::NoWork);
        };
        let key = item.key;
        debug!(item = %key, item_type = %item.item_type, resource = %item.resource_key, worker_id, "claimed work item");
        self.record(&item, "claim", None);

        let Some(_guard) = ResourceLockGuard::try_acquire(&self.locks, &item.resource_key, worker_id) else {
            item.status = WorkItemStatus::Pending;
            item.processor_id = None;
            item.scheduled_ms = after(now, Duration::from_millis(self.services.config.lock_retry_delay_ms));
            item.last_updated_ms = now;
            let item = self.write_back(&item, false)?;
            self.record(&item, "contention", None);
            return Ok(DispatchOutcome::LockContention(key));
        };

        let token = CancellationToken::new();
        if item.cancel_pending {
            token.cancel();
        }
        self.in_flight.lock().insert(key, token.clone());
        let _in_flight = InFlight {
            map: &self.in_flight,
            key,
        };

        let props = self.services.config.properties(item.item_type);
        let Some(mut processor) = self.registry.resolve(item.item_type) else {
            let failure = ItemFailure::fatal(format!("no processor registered for {}", item.item_type));
            apply_failure(&mut item, &failure, props, now);
            return self.finish(item, None, "fail", Some(failure.reason), false);
        };

        let services = &*self.services;
        let verdict = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = ItemContext {
                item: &mut item,
                cancel: &token,
                services,
                properties: props,
                now_ms: now,
            };
            drive(processor.as_mut(), &mut ctx)
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(&*payload);
            error!(item = %key, panic = %message, "item processor panicked");
            Verdict::Failed(ItemFailure::non_fatal(format!("processor panicked: {message}")))
        });

        let grace = secs(self.services.config.postpone_grace_secs);
        let cancelled = matches!(verdict, Verdict::Done(ProcessResult::Cancelled));
        let (action, detail, postponed) = apply_verdict(&mut item, verdict, props, grace, now);
        let outcome = self.finish(item, Some(processor), action, detail, cancelled)?;
        if postponed {
            return Ok(DispatchOutcome::Postponed(key));
        }
        Ok(outcome)
    }

    /// Claim the best due item whose study is unlocked and whose slot class
    /// has room, and take its slot.
    fn claim(&self, worker_id: &str, now: u64) -> Result<Option<(WorkQueueItem, SlotGuard<'_>)>, SchedulerError> {
        let config = &self.services.config;
        let locks = &self.locks;
        let mut usage = self.slots.lock();
        let general_open = config.priority_worker_count == 0 || usage.general < config.general_worker_count();
        let memory_open =
            config.memory_limited_worker_count == 0 || usage.memory_limited < config.memory_limited_worker_count;

        let eligible = |i: &WorkQueueItem| {
            !locks.is_locked(&i.resource_key)
                && (general_open || i.priority >= Priority::High)
                && (memory_open || !config.properties(i.item_type).memory_limited)
        };
        let Some(item) = self.services.queue.claim_next(worker_id, now, &eligible)? else {
            return Ok(None);
        };

        let class = SlotClass {
            general: item.priority < Priority::High,
            memory_limited: config.properties(item.item_type).memory_limited,
        };
        usage.take(class);
        Ok(Some((
            item,
            SlotGuard {
                usage: &self.slots,
                class,
            },
        )))
    }

    /// Store the worker's copy of `item`. A cancellation requested while the
    /// pass ran survives unless the pass consumed it or the item finished.
    fn write_back(&self, item: &WorkQueueItem, cancel_consumed: bool) -> Result<WorkQueueItem, SchedulerError> {
        self.services.queue.modify(&item.key, &mut |stored: &mut WorkQueueItem| {
            let requested = stored.cancel_pending || item.cancel_pending;
            *stored = item.clone();
            stored.cancel_pending = requested && !cancel_consumed && !stored.status.is_terminal();
            Ok(())
        })
    }

    fn finish(
        &self,
        mut item: WorkQueueItem,
        processor: Option<Box<dyn ItemProcessor>>,
        action: &str,
        detail: Option<String>,
        cancel_consumed: bool,
    ) -> Result<DispatchOutcome, SchedulerError> {
        item.processor_id = None;
        item.last_updated_ms = self.services.clock.now_ms().max(item.last_updated_ms);
        let item = self.write_back(&item, cancel_consumed)?;

        if let Some(mut processor) = processor {
            let status = item.status;
            let snapshot = &item;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| processor.post_processing(snapshot, status))) {
                warn!(item = %item.key, panic = %panic_message(&*payload), "post-processing panicked");
            }
        }

        match item.status {
            WorkItemStatus::Failed => {
                warn!(item = %item.key, reason = ?item.failure_description, "work item failed");
            }
            status => debug!(item = %item.key, ?status, action, "work item pass finished"),
        }
        self.record(&item, action, detail);
        Ok(DispatchOutcome::Processed {
            key: item.key,
            status: item.status,
        })
    }

    /// Ask for cancellation: persists `cancel_pending` and trips the token of
    /// the pass currently processing the item, if any.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ItemNotFound`], or [`SchedulerError::InvalidState`]
    /// for items already Complete or Failed.
    pub fn request_cancel(&self, key: &WorkItemKey) -> Result<WorkQueueItem, SchedulerError> {
        let item = self.services.queue.modify(key, &mut |item: &mut WorkQueueItem| {
            if item.status.is_terminal() {
                return Err(SchedulerError::InvalidState(format!("{} is {:?}", item.key, item.status)));
            }
            item.cancel_pending = true;
            Ok(())
        })?;
        if let Some(token) = self.in_flight.lock().get(key) {
            token.cancel();
        }
        self.record(&item, "cancel_requested", None);
        Ok(item)
    }

    /// Trip every in-flight cancellation token.
    pub fn cancel_all(&self) {
        for token in self.in_flight.lock().values() {
            token.cancel();
        }
    }

    /// Delete Complete and Failed items not updated within `older_than`.
    ///
    /// # Errors
    ///
    /// Work queue backend failures.
    pub fn purge_terminal(&self, older_than: Duration) -> Result<usize, SchedulerError> {
        let cutoff = self.services.clock.now_ms().saturating_sub(duration_ms(older_than));
        let purged = self.services.queue.purge_terminal(cutoff)?;
        if purged > 0 {
            info!(purged, cutoff_ms = cutoff, "purged finished work items");
        }
        Ok(purged)
    }

    /// Periodic maintenance: purge finished items past the retention window
    /// and drop expired destination blackouts. Returns the items purged.
    ///
    /// # Errors
    ///
    /// Work queue backend failures.
    pub fn housekeeping(&self) -> Result<usize, SchedulerError> {
        let purged = self.purge_terminal(self.services.config.terminal_retention())?;
        let blackouts = self.services.throttle.purge_expired();
        debug!(purged, blackouts, "work queue housekeeping done");
        Ok(purged)
    }

    /// Return items left InProgress by a previous run to Pending (or Failed
    /// once their retry budget is spent). Call before starting workers.
    ///
    /// # Errors
    ///
    /// Work queue backend failures.
    pub fn reset_orphaned_items(&self) -> Result<usize, SchedulerError> {
        let now = self.services.clock.now_ms();
        let config = Arc::clone(&self.services.config);
        let reset = self.services.queue.modify_where(&mut |item: &mut WorkQueueItem| {
            if item.status != WorkItemStatus::InProgress {
                return false;
            }
            let failure = ItemFailure::non_fatal(format!(
                "worker {} stopped while processing",
                item.processor_id.as_deref().unwrap_or("unknown")
            ));
            apply_failure(item, &failure, config.properties(item.item_type), now);
            item.scheduled_ms = now;
            item.processor_id = None;
            item.last_updated_ms = now;
            true
        })?;
        if reset > 0 {
            info!(reset, "reset orphaned in-progress work items");
        }
        Ok(reset)
    }
}

fn drive(processor: &mut dyn ItemProcessor, ctx: &mut ItemContext<'_>) -> Verdict {
    if let Err(failure) = processor.initialize(ctx) {
        return Verdict::InitFailed(failure);
    }
    if let Admission::Postpone { reason, delay } = processor.can_start(ctx) {
        return Verdict::Postponed { reason, delay };
    }
    match processor.process_item(ctx) {
        Ok(result) => Verdict::Done(result),
        Err(failure) => Verdict::Failed(failure),
    }
}

/// Count a failure and decide between retry and giving up.
fn apply_failure(item: &mut WorkQueueItem, failure: &ItemFailure, props: &WorkQueueTypeProperties, now: u64) {
    item.failure_count = item.failure_count.saturating_add(1);
    item.failure_description = Some(failure.reason.clone());

    if failure.kind == FailureType::Fatal || item.failure_count > props.max_failure_count {
        item.status = WorkItemStatus::Failed;
        item.expiration_ms = now;
        return;
    }

    item.status = WorkItemStatus::Pending;
    item.scheduled_ms = after(now, props.backoff(item.failure_count));
    let remaining = u64::from(props.max_failure_count - item.failure_count);
    item.expiration_ms = after(item.scheduled_ms, secs(remaining.saturating_mul(props.failure_delay_secs)));
}

/// Apply a handler verdict; returns the audit action, its detail and whether
/// the item was postponed.
fn apply_verdict(
    item: &mut WorkQueueItem,
    verdict: Verdict,
    props: &WorkQueueTypeProperties,
    grace: Duration,
    now: u64,
) -> (&'static str, Option<String>, bool) {
    match verdict {
        Verdict::InitFailed(failure) => {
            item.failure_count = item.failure_count.saturating_add(1);
            item.failure_description = Some(format!("initialize failed: {}", failure.reason));
            item.status = WorkItemStatus::Failed;
            item.expiration_ms = now;
            ("fail", item.failure_description.clone(), false)
        }
        Verdict::Postponed { reason, delay } => {
            item.status = WorkItemStatus::Pending;
            item.scheduled_ms = after(now, delay.unwrap_or_else(|| secs(props.postpone_delay_secs)));
            item.expiration_ms = after(item.scheduled_ms, grace);
            item.postpone_reason = Some(reason.clone());
            ("postpone", Some(reason), true)
        }
        Verdict::Done(ProcessResult::Complete) => {
            item.status = WorkItemStatus::Complete;
            item.postpone_reason = None;
            ("complete", None, false)
        }
        Verdict::Done(ProcessResult::Idle) => {
            item.postpone_reason = None;
            if now >= item.expiration_ms {
                item.status = WorkItemStatus::Complete;
                ("complete", Some("idle past expiration".into()), false)
            } else {
                item.status = WorkItemStatus::Idle;
                item.scheduled_ms = after(now, secs(props.idle_delay_secs)).min(item.expiration_ms);
                ("idle", None, false)
            }
        }
        Verdict::Done(ProcessResult::Pending) => {
            item.status = WorkItemStatus::Pending;
            item.postpone_reason = None;
            item.scheduled_ms = after(now, secs(props.process_delay_secs));
            item.expiration_ms = after(item.scheduled_ms, secs(props.expire_delay_secs));
            ("pending", None, false)
        }
        Verdict::Done(ProcessResult::Cancelled) => {
            item.status = WorkItemStatus::Pending;
            item.cancel_pending = false;
            item.scheduled_ms = now;
            ("cancelled", None, false)
        }
        Verdict::Failed(failure) => {
            apply_failure(item, &failure, props, now);
            let action = if item.status == WorkItemStatus::Failed { "fail" } else { "retry" };
            (action, Some(failure.reason), false)
        }
    }
}
