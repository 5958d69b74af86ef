use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::CacheState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub removed: u64,
    pub bytes_reclaimed: u64,
}

/// Wakes the eviction task. Requests made while a pass is pending coalesce into one.
#[derive(Debug, Default)]
pub(super) struct EvictionSignal {
    notify: Arc<Notify>,
}

impl EvictionSignal {
    pub(super) fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Runs passes on demand for as long as the cache state is alive.
pub(super) fn spawn_evictor(state: Weak<CacheState>, signal: &EvictionSignal) {
    let notify = signal.notify.clone();
    tokio::spawn(async move {
        loop {
            notify.notified().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            state.evict().await;
        }
        debug!("eviction task stopped");
    });
}

impl CacheState {
    /// Runs one pass unless another is already in progress.
    pub(super) async fn evict(&self) -> Option<EvictionStats> {
        let Ok(_pass) = self.eviction_lock.try_lock() else {
            debug!("eviction pass already running; skipping");
            return None;
        };
        let stats = self.eviction_pass().await;
        if stats.removed > 0 {
            info!(
                removed = stats.removed,
                bytes_reclaimed = stats.bytes_reclaimed,
                total_size = self.index.total_size(),
                max_bytes = self.max_bytes,
                "eviction pass finished"
            );
            crate::metrics::record_eviction(stats.removed, stats.bytes_reclaimed);
        }
        self.publish_usage();
        Some(stats)
    }

    /// Deletes least recently used entries until the total fits the budget. Ties on
    /// `last_used` are broken by key. A file that cannot be deleted still loses its record.
    async fn eviction_pass(&self) -> EvictionStats {
        let mut stats = EvictionStats::default();
        if self.index.total_size() <= self.max_bytes {
            return stats;
        }

        let mut candidates = self.index.snapshot();
        candidates.sort_by(|a, b| {
            a.last_used_nanos()
                .cmp(&b.last_used_nanos())
                .then_with(|| a.key().cmp(b.key()))
        });

        for entry in candidates {
            if self.index.total_size() <= self.max_bytes {
                break;
            }
            let _publish = self.publish_lock.lock().await;
            let still_indexed = self
                .index
                .get(entry.key())
                .is_some_and(|current| Arc::ptr_eq(&current, &entry));
            if !still_indexed {
                continue;
            }

            let path = self.store.entry_path(entry.key());
            match self.store.remove_file(&path).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key = %entry.key(), "evicted entry's file was already gone");
                }
                Err(err) => {
                    warn!(
                        key = %entry.key(),
                        path = %path.display(),
                        error = %err,
                        "failed to delete cache file during eviction"
                    );
                }
            }
            if self.index.remove_if_same(&entry) {
                stats.removed += 1;
                stats.bytes_reclaimed += entry.size_bytes();
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{open_test_cache, seed_entry};
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    #[tokio::test]
    async fn evicts_least_recently_used_until_within_budget() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = open_test_cache(dir.path(), 25).await?;
        let a = seed_entry(&cache, "/a", 10, UNIX_EPOCH + Duration::from_secs(1)).await?;
        let b = seed_entry(&cache, "/b", 10, UNIX_EPOCH + Duration::from_secs(2)).await?;
        let c = seed_entry(&cache, "/c", 10, UNIX_EPOCH + Duration::from_secs(3)).await?;

        let stats = cache.evict_now().await.expect("no pass running");
        assert_eq!(
            stats,
            EvictionStats {
                removed: 1,
                bytes_reclaimed: 10
            }
        );
        assert!(cache.lookup(&a).is_none());
        assert!(!cache.entry_path(&a).exists());
        assert!(cache.lookup(&b).is_some());
        assert!(cache.lookup(&c).is_some());
        assert_eq!(cache.total_size(), 20);
        Ok(())
    }

    #[tokio::test]
    async fn within_budget_is_a_no_op() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = open_test_cache(dir.path(), 100).await?;
        seed_entry(&cache, "/a", 10, UNIX_EPOCH).await?;
        let stats = cache.evict_now().await.expect("no pass running");
        assert_eq!(stats, EvictionStats::default());
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn externally_deleted_files_still_release_budget() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = open_test_cache(dir.path(), 5).await?;
        let a = seed_entry(&cache, "/a", 10, UNIX_EPOCH).await?;
        std::fs::remove_file(cache.entry_path(&a))?;

        let stats = cache.evict_now().await.expect("no pass running");
        assert_eq!(stats.removed, 1);
        assert_eq!(cache.total_size(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn undeletable_file_still_releases_its_record() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = open_test_cache(dir.path(), 10).await?;
        let a = seed_entry(&cache, "/a", 10, UNIX_EPOCH + Duration::from_secs(1)).await?;
        let b = seed_entry(&cache, "/b", 10, UNIX_EPOCH + Duration::from_secs(2)).await?;
        let blocked = cache.entry_path(&a);
        std::fs::remove_file(&blocked)?;
        std::fs::create_dir(&blocked)?;
        std::fs::write(blocked.join("pinned"), b"x")?;

        let stats = cache.evict_now().await.expect("no pass running");
        assert_eq!(
            stats,
            EvictionStats {
                removed: 1,
                bytes_reclaimed: 10
            }
        );
        assert!(cache.lookup(&a).is_none());
        assert!(cache.lookup(&b).is_some());
        assert_eq!(cache.total_size(), 10);
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn pass_waits_for_a_publish_in_progress() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = open_test_cache(dir.path(), 5).await?;
        let a = seed_entry(&cache, "/a", 10, UNIX_EPOCH).await?;

        let publishing = cache.state.publish_lock.lock().await;
        let pass = cache.evict_now();
        tokio::pin!(pass);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut pass)
                .await
                .is_err()
        );
        assert!(cache.entry_path(&a).exists());
        assert!(cache.lookup(&a).is_some());

        drop(publishing);
        let stats = pass.await.expect("no other pass running");
        assert_eq!(stats.removed, 1);
        assert!(!cache.entry_path(&a).exists());
        Ok(())
    }

    #[tokio::test]
    async fn equal_timestamps_evict_in_key_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cache = open_test_cache(dir.path(), 10).await?;
        let when = UNIX_EPOCH + Duration::from_secs(7);
        let first = seed_entry(&cache, "/one", 10, when).await?;
        let second = seed_entry(&cache, "/two", 10, when).await?;
        let (older, newer) = if first < second {
            (first, second)
        } else {
            (second, first)
        };

        cache.evict_now().await.expect("no pass running");
        assert!(cache.lookup(&older).is_none());
        assert!(cache.lookup(&newer).is_some());
        Ok(())
    }
}
