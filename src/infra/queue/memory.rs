//! In-memory work queue table.

use parking_lot::Mutex;

use super::{ItemFilter, ItemTable, WorkQueueStore};
use crate::core::error::SchedulerError;
use crate::core::work_item::WorkQueueItem;
use crate::util::serde::WorkItemKey;

/// Work queue held in process memory; lost on restart.
#[derive(Debug)]
pub struct InMemoryWorkQueueStore {
    table: Mutex<ItemTable>,
}

impl InMemoryWorkQueueStore {
    /// Create a store refusing inserts beyond `max_depth` items.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            table: Mutex::new(ItemTable::new(max_depth)),
        }
    }
}

impl WorkQueueStore for InMemoryWorkQueueStore {
    fn insert(&self, item: WorkQueueItem) -> Result<(), SchedulerError> {
        self.table.lock().insert(item)
    }

    fn get(&self, key: &WorkItemKey) -> Result<Option<WorkQueueItem>, SchedulerError> {
        Ok(self.table.lock().get(key))
    }

    fn claim_next(
        &self,
        worker: &str,
        now_ms: u64,
        eligible: ItemFilter<'_>,
    ) -> Result<Option<WorkQueueItem>, SchedulerError> {
        Ok(self.table.lock().claim_next(worker, now_ms, eligible))
    }

    fn modify(
        &self,
        key: &WorkItemKey,
        f: &mut dyn FnMut(&mut WorkQueueItem) -> Result<(), SchedulerError>,
    ) -> Result<WorkQueueItem, SchedulerError> {
        self.table.lock().modify(key, f)
    }

    fn modify_where(&self, f: &mut dyn FnMut(&mut WorkQueueItem) -> bool) -> Result<usize, SchedulerError> {
        Ok(self.table.lock().modify_where(f))
    }

    fn list(&self, filter: ItemFilter<'_>) -> Result<Vec<WorkQueueItem>, SchedulerError> {
        Ok(self.table.lock().list(filter))
    }

    fn remove(&self, key: &WorkItemKey) -> Result<Option<WorkQueueItem>, SchedulerError> {
        Ok(self.table.lock().remove(key))
    }

    fn purge_terminal(&self, before_ms: u64) -> Result<usize, SchedulerError> {
        Ok(self.table.lock().purge_terminal(before_ms))
    }

    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::core::work_item::{WorkItemStatus, WorkItemType};
    use crate::util::serde::{Priority, ResourceKey};

    #[test]
    fn concurrent_claims_hand_out_each_item_once() {
        let store = Arc::new(InMemoryWorkQueueStore::new(1_000));
        for i in 0..200 {
            store
                .insert(WorkQueueItem::new(
                    WorkItemType::AutoRoute,
                    ResourceKey::from(format!("study-{i}")),
                    0,
                    0,
                    Priority::Normal,
                    0,
                ))
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(item) = store.claim_next(&format!("w{w}"), 10, &|_| true).unwrap() {
                        claimed.push(item.key);
                    }
                    claimed
                })
            })
            .collect();

        let mut all: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(store.list_status(WorkItemStatus::InProgress).unwrap().len(), 200);
    }

    #[test]
    fn modify_is_atomic_and_reports_missing_items() {
        let store = InMemoryWorkQueueStore::new(10);
        let item = WorkQueueItem::new(
            WorkItemType::DeleteStudy,
            ResourceKey::from("s"),
            0,
            0,
            Priority::Low,
            0,
        );
        let key = item.key;
        store.insert(item).unwrap();

        let err = store
            .modify(&key, &mut |i| {
                i.cancel_pending = true;
                Err(SchedulerError::InvalidState("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState(_)));
        assert!(!store.get(&key).unwrap().unwrap().cancel_pending);

        let missing = WorkItemKey::new();
        assert!(matches!(
            store.modify(&missing, &mut |_| Ok(())),
            Err(SchedulerError::ItemNotFound(_))
        ));
    }
}
