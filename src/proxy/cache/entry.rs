use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::CacheKey;

#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    size_bytes: u64,
    /// Nanoseconds since the Unix epoch.
    last_used: AtomicU64,
}

impl CacheEntry {
    pub(super) fn new(key: CacheKey, size_bytes: u64, last_used: SystemTime) -> Self {
        Self {
            key,
            size_bytes,
            last_used: AtomicU64::new(epoch_nanos(last_used)),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn last_used(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.last_used_nanos())
    }

    pub(super) fn last_used_nanos(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub(super) fn touch(&self, now: SystemTime) {
        self.last_used.store(epoch_nanos(now), Ordering::Relaxed);
    }
}

fn epoch_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
