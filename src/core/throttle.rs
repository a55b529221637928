//! Destination blackout cache for admission control.
//!
//! An entry marks a destination as temporarily inadmissible until its expiry.
//! Entries expire on their own; [`ThrottleCache::purge_expired`] only reclaims
//! memory.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::util::clock::{duration_ms, SharedClock};

/// Time-bounded blackout cache, read-mostly.
pub struct ThrottleCache {
    clock: SharedClock,
    entries: RwLock<HashMap<String, u64>>,
}

impl ThrottleCache {
    /// Empty cache reading time from `clock`.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `destination` is currently blacked out.
    #[must_use]
    pub fn is_blacked_out(&self, destination: &str) -> bool {
        let now = self.clock.now_ms();
        self.entries
            .read()
            .get(destination)
            .is_some_and(|expires| *expires > now)
    }

    /// Black out `destination` for `duration`. An existing longer blackout is
    /// kept.
    pub fn block(&self, destination: &str, duration: Duration) {
        let expires = self.clock.now_ms().saturating_add(duration_ms(duration));
        let mut entries = self.entries.write();
        let entry = entries.entry(destination.to_owned()).or_insert(0);
        *entry = (*entry).max(expires);
        debug!(destination, expires_ms = *entry, "destination blacked out");
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires| *expires > now);
        before - entries.len()
    }

    /// Number of entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::util::clock::ManualClock;

    #[test]
    fn blackout_expires_after_duration() {
        let clock = ManualClock::new(10_000);
        let cache = ThrottleCache::new(Arc::new(clock.clone()));

        assert!(!cache.is_blacked_out("PACS_B"));
        cache.block("PACS_B", Duration::from_secs(5));
        assert!(cache.is_blacked_out("PACS_B"));
        assert!(!cache.is_blacked_out("PACS_C"));

        clock.advance(Duration::from_millis(4_999));
        assert!(cache.is_blacked_out("PACS_B"));
        clock.advance(Duration::from_millis(1));
        assert!(!cache.is_blacked_out("PACS_B"));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn shorter_block_does_not_shorten_existing() {
        let clock = ManualClock::new(0);
        let cache = ThrottleCache::new(Arc::new(clock.clone()));
        cache.block("d", Duration::from_secs(10));
        cache.block("d", Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));
        assert!(cache.is_blacked_out("d"));
    }
}
