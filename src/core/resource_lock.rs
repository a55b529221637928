//! Exclusive per-study write locks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::util::serde::ResourceKey;

/// Lock table consumed from the resource layer. At most one holder per key.
pub trait ResourceLockTable: Send + Sync {
    /// Try to take the write lock for `key` on behalf of `owner`. Never blocks.
    fn acquire_write_lock(&self, key: &ResourceKey, owner: &str) -> bool;

    /// Release the lock if `owner` holds it.
    fn release_write_lock(&self, key: &ResourceKey, owner: &str);

    /// Current holder, if any.
    fn holder(&self, key: &ResourceKey) -> Option<String>;

    /// Whether anyone holds `key`.
    fn is_locked(&self, key: &ResourceKey) -> bool {
        self.holder(key).is_some()
    }
}

/// Process-local lock table.
#[derive(Debug, Default)]
pub struct InMemoryResourceLocks {
    held: Mutex<HashMap<ResourceKey, String>>,
}

impl InMemoryResourceLocks {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of held locks.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

impl ResourceLockTable for InMemoryResourceLocks {
    fn acquire_write_lock(&self, key: &ResourceKey, owner: &str) -> bool {
        let mut held = self.held.lock();
        if held.contains_key(key) {
            return false;
        }
        held.insert(key.clone(), owner.to_owned());
        true
    }

    fn release_write_lock(&self, key: &ResourceKey, owner: &str) {
        let mut held = self.held.lock();
        match held.get(key) {
            Some(current) if current == owner => {
                held.remove(key);
            }
            Some(current) => {
                warn!(resource = %key, owner, holder = %current, "release by non-holder ignored");
            }
            None => {}
        }
    }

    fn holder(&self, key: &ResourceKey) -> Option<String> {
        self.held.lock().get(key).cloned()
    }
}

/// Held lock; released on drop, including during unwinding.
pub struct ResourceLockGuard {
    table: Arc<dyn ResourceLockTable>,
    key: ResourceKey,
    owner: String,
}

impl ResourceLockGuard {
    /// Acquire `key` for `owner`, or `None` on contention.
    #[must_use]
    pub fn try_acquire(table: &Arc<dyn ResourceLockTable>, key: &ResourceKey, owner: &str) -> Option<Self> {
        if !table.acquire_write_lock(key, owner) {
            debug!(resource = %key, owner, "resource lock contention");
            return None;
        }
        Some(Self {
            table: Arc::clone(table),
            key: key.clone(),
            owner: owner.to_owned(),
        })
    }

    /// Locked resource.
    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        self.table.release_write_lock(&self.key, &self.owner);
        debug!(resource = %self.key, owner = %self.owner, "resource lock released");
    }
}
