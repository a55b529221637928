//! Work queue table backends.
//!
//! The table is the coordination point between workers: `claim_next` moves
//! exactly one due item from Pending/Idle to InProgress under the store's
//! lock, so two workers can never claim the same item.

pub mod file;
pub mod memory;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::core::error::SchedulerError;
use crate::core::work_item::{WorkItemStatus, WorkQueueItem};
use crate::util::serde::{ResourceKey, WorkItemKey};

pub use file::FileWorkQueueStore;
pub use memory::InMemoryWorkQueueStore;

/// Predicate used to filter candidate items.
pub type ItemFilter<'a> = &'a dyn Fn(&WorkQueueItem) -> bool;

/// Persisted work queue table.
pub trait WorkQueueStore: Send + Sync {
    /// Add a new item.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueFull`] at maximum depth.
    fn insert(&self, item: WorkQueueItem) -> Result<(), SchedulerError>;

    /// Load an item.
    fn get(&self, key: &WorkItemKey) -> Result<Option<WorkQueueItem>, SchedulerError>;

    /// Atomically claim the best due item accepted by `eligible`.
    ///
    /// Candidates are Pending/Idle items scheduled at or before `now_ms`
    /// whose resource has no other item in progress, ordered by priority
    /// (highest first), then scheduled time, then creation time. The claimed
    /// item is returned already marked InProgress and owned by `worker`.
    fn claim_next(
        &self,
        worker: &str,
        now_ms: u64,
        eligible: ItemFilter<'_>,
    ) -> Result<Option<WorkQueueItem>, SchedulerError>;

    /// Atomically mutate one item and return its new state.
    fn modify(
        &self,
        key: &WorkItemKey,
        f: &mut dyn FnMut(&mut WorkQueueItem) -> Result<(), SchedulerError>,
    ) -> Result<WorkQueueItem, SchedulerError>;

    /// Atomically mutate every item for which `f` returns `true`; returns the
    /// number of items changed.
    fn modify_where(&self, f: &mut dyn FnMut(&mut WorkQueueItem) -> bool) -> Result<usize, SchedulerError>;

    /// Items matching `filter`, in dispatch order.
    fn list(&self, filter: ItemFilter<'_>) -> Result<Vec<WorkQueueItem>, SchedulerError>;

    /// Delete an item.
    fn remove(&self, key: &WorkItemKey) -> Result<Option<WorkQueueItem>, SchedulerError>;

    /// Delete Complete and Failed items last updated at or before
    /// `before_ms`; returns how many were removed.
    fn purge_terminal(&self, before_ms: u64) -> Result<usize, SchedulerError>;

    /// Stored items, terminal ones included.
    fn len(&self) -> usize;

    /// Whether the table is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every item on `resource`.
    fn find_by_resource(&self, resource: &ResourceKey) -> Result<Vec<WorkQueueItem>, SchedulerError> {
        self.list(&|item| &item.resource_key == resource)
    }

    /// Items in `status`.
    fn list_status(&self, status: WorkItemStatus) -> Result<Vec<WorkQueueItem>, SchedulerError> {
        self.list(&|item| item.status == status)
    }
}

/// Shared item table used by both backends.
#[derive(Debug, Default, Clone)]
pub(crate) struct ItemTable {
    max_depth: usize,
    items: HashMap<WorkItemKey, WorkQueueItem>,
}

fn dispatch_order(a: &WorkQueueItem, b: &WorkQueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_ms.cmp(&b.scheduled_ms))
        .then(a.created_at_ms.cmp(&b.created_at_ms))
}

impl ItemTable {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            items: HashMap::new(),
        }
    }

    pub(crate) fn from_items(max_depth: usize, items: impl IntoIterator<Item = WorkQueueItem>) -> Self {
        Self {
            max_depth,
            items: items.into_iter().map(|i| (i.key, i)).collect(),
        }
    }

    pub(crate) fn items(&self) -> impl Iterator<Item = &WorkQueueItem> {
        self.items.values()
    }

    /// Items still Pending, Idle or InProgress. Only these count toward the
    /// maximum depth.
    pub(crate) fn active_len(&self) -> usize {
        self.items.values().filter(|i| !i.status.is_terminal()).count()
    }

    pub(crate) fn insert(&mut self, item: WorkQueueItem) -> Result<(), SchedulerError> {
        if self.active_len() >= self.max_depth {
            return Err(SchedulerError::QueueFull("max queue depth reached".into()));
        }
        if self.items.contains_key(&item.key) {
            return Err(SchedulerError::InvalidState(format!("duplicate work item {}", item.key)));
        }
        self.items.insert(item.key, item);
        Ok(())
    }

    pub(crate) fn get(&self, key: &WorkItemKey) -> Option<WorkQueueItem> {
        self.items.get(key).cloned()
    }

    pub(crate) fn claim_next(
        &mut self,
        worker: &str,
        now_ms: u64,
        eligible: ItemFilter<'_>,
    ) -> Option<WorkQueueItem> {
        let busy: HashSet<&ResourceKey> = self
            .items
            .values()
            .filter(|i| i.status == WorkItemStatus::InProgress)
            .map(|i| &i.resource_key)
            .collect();

        let key = self
            .items
            .values()
            .filter(|i| i.is_due(now_ms) && !busy.contains(&i.resource_key) && eligible(i))
            .min_by(|a, b| dispatch_order(a, b))
            .map(|i| i.key)?;

        let item = self.items.get_mut(&key)?;
        item.status = WorkItemStatus::InProgress;
        item.processor_id = Some(worker.to_owned());
        item.last_updated_ms = now_ms;
        Some(item.clone())
    }

    pub(crate) fn modify(
        &mut self,
        key: &WorkItemKey,
        f: &mut dyn FnMut(&mut WorkQueueItem) -> Result<(), SchedulerError>,
    ) -> Result<WorkQueueItem, SchedulerError> {
        let slot = self.items.get_mut(key).ok_or(SchedulerError::ItemNotFound(*key))?;
        let mut next = slot.clone();
        f(&mut next)?;
        *slot = next.clone();
        Ok(next)
    }

    pub(crate) fn modify_where(&mut self, f: &mut dyn FnMut(&mut WorkQueueItem) -> bool) -> usize {
        let mut changed = 0;
        for item in self.items.values_mut() {
            if f(item) {
                changed += 1;
            }
        }
        changed
    }

    pub(crate) fn list(&self, filter: ItemFilter<'_>) -> Vec<WorkQueueItem> {
        let mut out: Vec<_> = self.items.values().filter(|i| filter(i)).cloned().collect();
        out.sort_by(dispatch_order);
        out
    }

    pub(crate) fn remove(&mut self, key: &WorkItemKey) -> Option<WorkQueueItem> {
        self.items.remove(key)
    }

    pub(crate) fn purge_terminal(&mut self, before_ms: u64) -> usize {
        let before = self.items.len();
        self.items
            .retain(|_, i| !(i.status.is_terminal() && i.last_updated_ms <= before_ms));
        before - self.items.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
