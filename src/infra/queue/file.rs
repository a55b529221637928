//! File-backed work queue table.
//!
//! The whole table is kept in memory and mirrored to a JSON-lines file. Every
//! mutation rewrites the file through a temp sibling and a rename, so a crash
//! leaves either the old or the new table on disk, never a torn one.
//!
//! Mutations are applied to a copy of the table. The copy replaces the live
//! table only after it has been written, so a failed write leaves memory and
//! disk agreeing.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::{ItemFilter, ItemTable, WorkQueueStore};
use crate::core::error::SchedulerError;
use crate::core::work_item::WorkQueueItem;
use crate::util::serde::WorkItemKey;

fn backend(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Backend(e.to_string())
}

/// Durable work queue persisted as `<dir>/<stream>.jsonl`.
#[derive(Debug)]
pub struct FileWorkQueueStore {
    path: PathBuf,
    table: Mutex<ItemTable>,
}

impl FileWorkQueueStore {
    /// Open (or create) the queue file and load existing items.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backend`] on IO or parse failures.
    pub fn open(dir: impl AsRef<Path>, stream: &str, max_depth: usize) -> Result<Self, SchedulerError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(backend)?;
        let path = dir.join(format!("{stream}.jsonl"));
        let items = load(&path)?;
        debug!(path = %path.display(), items = items.len(), "work queue loaded");
        Ok(Self {
            path,
            table: Mutex::new(ItemTable::from_items(max_depth, items)),
        })
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, table: &ItemTable) -> Result<(), SchedulerError> {
        let temp = self.path.with_extension("jsonl.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp)
                .map_err(backend)?;
            let mut writer = BufWriter::new(file);
            for item in table.items() {
                let line = serde_json::to_string(item).map_err(backend)?;
                writeln!(writer, "{line}").map_err(backend)?;
            }
            writer.flush().map_err(backend)?;
            writer.get_ref().sync_all().map_err(backend)?;
        }
        fs::rename(&temp, &self.path).map_err(backend)
    }

    /// Apply `f` to a copy of the table and commit it once `dirty` says the
    /// result needs writing and the write succeeded.
    fn mutate_if<T>(
        &self,
        f: impl FnOnce(&mut ItemTable) -> Result<T, SchedulerError>,
        dirty: impl FnOnce(&T) -> bool,
    ) -> Result<T, SchedulerError> {
        let mut table = self.table.lock();
        let mut next = table.clone();
        let out = f(&mut next)?;
        if dirty(&out) {
            self.persist(&next)?;
            *table = next;
        }
        Ok(out)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ItemTable) -> Result<T, SchedulerError>) -> Result<T, SchedulerError> {
        self.mutate_if(f, |_| true)
    }
}

fn load(path: &Path) -> Result<Vec<WorkQueueItem>, SchedulerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path).map_err(backend)?);
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(backend)?;
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line).map_err(backend)?);
    }
    Ok(items)
}

impl WorkQueueStore for FileWorkQueueStore {
    fn insert(&self, item: WorkQueueItem) -> Result<(), SchedulerError> {
        self.mutate(|t| t.insert(item))
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
        self.mutate_if(|t| Ok(t.claim_next(worker, now_ms, eligible)), Option::is_some)
    }

    fn modify(
        &self,
        key: &WorkItemKey,
        f: &mut dyn FnMut(&mut WorkQueueItem) -> Result<(), SchedulerError>,
    ) -> Result<WorkQueueItem, SchedulerError> {
        self.mutate(|t| t.modify(key, f))
    }

    fn modify_where(&self, f: &mut dyn FnMut(&mut WorkQueueItem) -> bool) -> Result<usize, SchedulerError> {
        self.mutate_if(|t| Ok(t.modify_where(f)), |changed| *changed > 0)
    }

    fn list(&self, filter: ItemFilter<'_>) -> Result<Vec<WorkQueueItem>, SchedulerError> {
        Ok(self.table.lock().list(filter))
    }

    fn remove(&self, key: &WorkItemKey) -> Result<Option<WorkQueueItem>, SchedulerError> {
        self.mutate(|t| Ok(t.remove(key)))
    }

    fn purge_terminal(&self, before_ms: u64) -> Result<usize, SchedulerError> {
        self.mutate_if(|t| Ok(t.purge_terminal(before_ms)), |removed| *removed > 0)
    }

    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::core::work_item::{WorkItemStatus, WorkItemType, WorkItemUnit};
    use crate::util::serde::{Priority, ResourceKey};

    #[test]
    fn items_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let item = WorkQueueItem::new(
            WorkItemType::AutoRoute,
            ResourceKey::from("study-1"),
            0,
            1_000,
            Priority::High,
            0,
        )
        .with_data(json!({"destination": "PACS_B"}))
        .with_units(vec![WorkItemUnit::new("1.2.3", "1.2.3.dcm")]);
        let key = item.key;

        {
            let store = FileWorkQueueStore::open(dir.path(), "work_queue", 10).unwrap();
            store.insert(item.clone()).unwrap();
            let claimed = store.claim_next("w1", 5, &|_| true).unwrap().unwrap();
            assert_eq!(claimed.key, key);
        }

        let reopened = FileWorkQueueStore::open(dir.path(), "work_queue", 10).unwrap();
        let loaded = reopened.get(&key).unwrap().unwrap();
        assert_eq!(loaded.status, WorkItemStatus::InProgress);
        assert_eq!(loaded.processor_id.as_deref(), Some("w1"));
        assert_eq!(loaded.data, item.data);
        assert_eq!(loaded.units, item.units);
    }

    #[test]
    fn remove_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = FileWorkQueueStore::open(dir.path(), "q", 10).unwrap();
        let item = WorkQueueItem::new(
            WorkItemType::DeleteStudy,
            ResourceKey::from("s"),
            0,
            0,
            Priority::Normal,
            0,
        );
        let key = item.key;
        store.insert(item).unwrap();
        store.remove(&key).unwrap();
        drop(store);

        let reopened = FileWorkQueueStore::open(dir.path(), "q", 10).unwrap();
        assert!(reopened.is_empty());
        assert!(!reopened.path().with_extension("jsonl.tmp").exists());
    }

    fn delete_item(resource: &str) -> WorkQueueItem {
        WorkQueueItem::new(
            WorkItemType::DeleteStudy,
            ResourceKey::from(resource),
            0,
            60_000,
            Priority::Normal,
            0,
        )
    }

    #[test]
    fn failed_write_leaves_table_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = FileWorkQueueStore::open(dir.path(), "q", 10).unwrap();
        let queued = delete_item("study-1");
        let queued_key = queued.key;
        store.insert(queued).unwrap();

        // A directory squatting on the temp path makes every rewrite fail.
        let temp = store.path().with_extension("jsonl.tmp");
        fs::create_dir(&temp).unwrap();

        let rejected = delete_item("study-2");
        let rejected_key = rejected.key;
        assert!(matches!(store.insert(rejected), Err(SchedulerError::Backend(_))));
        assert_eq!(store.len(), 1);
        assert!(store.get(&rejected_key).unwrap().is_none());

        assert!(store.claim_next("w1", 10, &|_| true).is_err());
        let still_queued = store.get(&queued_key).unwrap().unwrap();
        assert_eq!(still_queued.status, WorkItemStatus::Pending);
        assert_eq!(still_queued.processor_id, None);

        fs::remove_dir(&temp).unwrap();
        let claimed = store.claim_next("w1", 10, &|_| true).unwrap().unwrap();
        assert_eq!(claimed.key, queued_key);
    }

    #[test]
    fn purge_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = FileWorkQueueStore::open(dir.path(), "q", 1).unwrap();
        let mut done = delete_item("study-1");
        done.status = WorkItemStatus::Complete;
        done.last_updated_ms = 1_000;
        store.insert(done).unwrap();
        store.insert(delete_item("study-2")).unwrap();

        assert_eq!(store.purge_terminal(999).unwrap(), 0);
        assert_eq!(store.purge_terminal(1_000).unwrap(), 1);
        drop(store);

        let reopened = FileWorkQueueStore::open(dir.path(), "q", 1).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.list_status(WorkItemStatus::Complete).unwrap().len(), 0);
    }
}
