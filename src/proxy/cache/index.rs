use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{CacheEntry, CacheKey};

/// Key to entry map plus a running byte total. The total always equals the sum of the
/// entries' sizes once concurrent updates settle.
#[derive(Debug, Default)]
pub(super) struct CacheIndex {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    total_size: AtomicU64,
}

impl CacheIndex {
    pub(super) fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Inserts `entry`, replacing and returning any previous entry for the same key.
    pub(super) fn insert(&self, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        let mut guard = self.entries.write();
        self.total_size
            .fetch_add(entry.size_bytes(), Ordering::AcqRel);
        let previous = guard.insert(entry.key().clone(), entry);
        if let Some(previous) = previous.as_ref() {
            self.subtract(previous.size_bytes());
        }
        previous
    }

    /// Removes the record only while the index still maps its key to this exact entry.
    pub(super) fn remove_if_same(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut guard = self.entries.write();
        let same = guard
            .get(entry.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if same {
            guard.remove(entry.key());
            self.subtract(entry.size_bytes());
        }
        same
    }

    /// Replaces the whole content, recomputing the total from scratch.
    pub(super) fn reset(&self, entries: Vec<CacheEntry>) {
        let mut guard = self.entries.write();
        guard.clear();
        let mut total = 0u64;
        for entry in entries {
            total = total.saturating_add(entry.size_bytes());
            guard.insert(entry.key().clone(), Arc::new(entry));
        }
        self.total_size.store(total, Ordering::Release);
    }

    pub(super) fn snapshot(&self) -> Vec<Arc<CacheEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub(super) fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub(super) fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn subtract(&self, bytes: u64) {
        let _ = self
            .total_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_sub(bytes))
            });
    }
}
