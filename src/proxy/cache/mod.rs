//! Disk-backed object cache: index, single-flight downloads and size-bounded eviction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};
use thiserror::Error;
use tokio::task;
use tracing::{debug, info};

mod download;
mod entry;
mod eviction;
mod index;
mod inflight;
mod key;
mod rebuild;
mod store;

pub use entry::CacheEntry;
pub use eviction::EvictionStats;
pub use key::CacheKey;

use eviction::{EvictionSignal, spawn_evictor};
use index::CacheIndex;
use inflight::InFlight;
use store::CacheStore;

use crate::proxy::origin::OriginClient;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub dir: PathBuf,
    pub max_bytes: u64,
    /// Origin attempts per download.
    pub attempts: u32,
    /// How long a request waits for a download owned by another request.
    pub wait_timeout: Duration,
    /// Bound on a single origin attempt, body included.
    pub attempt_timeout: Duration,
}

impl CacheOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            dir: settings.cache_dir.clone(),
            max_bytes: settings.max_cache_bytes()?,
            attempts: settings.download_attempts,
            wait_timeout: settings.download_wait_timeout(),
            attempt_timeout: settings.origin_timeout(),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out waiting for a concurrent download")]
    WaitTimeout,
    #[error("concurrent download finished without an entry")]
    PeerFailed,
    #[error("origin download failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

pub struct DiskCache {
    state: Arc<CacheState>,
}

struct CacheState {
    store: CacheStore,
    index: CacheIndex,
    inflight: InFlight,
    evictor: EvictionSignal,
    eviction_lock: tokio::sync::Mutex<()>,
    /// Held while a final entry path is renamed into or deleted, together with the matching
    /// index update.
    publish_lock: tokio::sync::Mutex<()>,
    origin: OriginClient,
    max_bytes: u64,
    attempts: u32,
    wait_timeout: Duration,
    attempt_timeout: Duration,
}

impl DiskCache {
    /// Creates the cache directory if needed, rebuilds the index from its content and starts
    /// the eviction task.
    pub async fn open(options: CacheOptions, origin: OriginClient) -> Result<Self> {
        let cache = Self::load(options, origin).await?;
        spawn_evictor(Arc::downgrade(&cache.state), &cache.state.evictor);
        cache.state.evictor.trigger();
        Ok(cache)
    }

    async fn load(options: CacheOptions, origin: OriginClient) -> Result<Self> {
        let CacheOptions {
            dir,
            max_bytes,
            attempts,
            wait_timeout,
            attempt_timeout,
        } = options;
        let store = CacheStore::new(dir);
        store.ensure_dir().await?;

        let scan_dir = store.dir().to_path_buf();
        let outcome = task::spawn_blocking(move || rebuild::scan_cache_dir(&scan_dir))
            .await
            .map_err(|err| anyhow!("cache rebuild task failed: {err}"))??;

        let state = CacheState {
            store,
            index: CacheIndex::default(),
            inflight: InFlight::default(),
            evictor: EvictionSignal::default(),
            eviction_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
            origin,
            max_bytes,
            attempts,
            wait_timeout,
            attempt_timeout,
        };
        let discovered = outcome.entries.len();
        state.index.reset(outcome.entries);
        info!(
            dir = %state.store.dir().display(),
            entries = discovered,
            total_size = state.index.total_size(),
            max_bytes,
            temp_removed = outcome.temp_removed,
            unrecognised = outcome.foreign,
            "cache index rebuilt from disk"
        );
        state.publish_usage();

        Ok(Self {
            state: Arc::new(state),
        })
    }

    /// Index lookup. Counts toward the hit/miss metrics.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let entry = self.state.index.get(key);
        crate::metrics::record_cache_lookup(entry.is_some());
        entry
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.index.get(key).is_some()
    }

    /// Produces the entry for `key`, downloading `path` from the origin when it is missing.
    pub async fn fetch(&self, key: &CacheKey, path: &str) -> Result<Arc<CacheEntry>, FetchError> {
        self.state.fetch(key, path).await
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.state.store.entry_path(key)
    }

    /// Marks an entry as just used, in memory and on its file.
    pub async fn touch(&self, entry: &CacheEntry) {
        let now = SystemTime::now();
        entry.touch(now);
        let path = self.state.store.entry_path(entry.key());
        if let Err(err) = self.state.store.set_mtime(path, now).await {
            debug!(key = %entry.key(), error = %format!("{err:#}"), "failed to refresh mtime");
        }
    }

    /// Drops an entry whose file disappeared underneath the cache.
    pub fn forget(&self, entry: &Arc<CacheEntry>) -> bool {
        let removed = self.state.index.remove_if_same(entry);
        if removed {
            debug!(key = %entry.key(), "forgot cache entry with missing file");
            self.state.publish_usage();
        }
        removed
    }

    pub fn total_size(&self) -> u64 {
        self.state.index.total_size()
    }

    pub fn len(&self) -> usize {
        self.state.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.state.max_bytes
    }

    pub fn dir(&self) -> &Path {
        self.state.store.dir()
    }

    /// Runs an eviction pass now. Returns `None` if a pass was already running.
    pub async fn evict_now(&self) -> Option<EvictionStats> {
        self.state.evict().await
    }
}

impl CacheState {
    fn publish_usage(&self) {
        crate::metrics::set_cache_usage(self.index.total_size(), self.index.len());
    }
}

impl Drop for CacheState {
    fn drop(&mut self) {
        // Lets the eviction task observe that the state is gone.
        self.evictor.trigger();
    }
}
