use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, ensure};
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::inflight::Registration;
use super::{CacheEntry, CacheKey, CacheState, FetchError};

impl CacheState {
    /// Returns the entry for `key`, downloading `path` from the origin if needed. Concurrent
    /// calls for the same key share one download.
    pub(super) async fn fetch(
        &self,
        key: &CacheKey,
        path: &str,
    ) -> Result<Arc<CacheEntry>, FetchError> {
        if let Some(entry) = self.index.get(key) {
            return Ok(entry);
        }

        match self.inflight.register(key) {
            Registration::Waiter(notify) => {
                debug!(key = %key, "download already in flight; waiting");
                let waited = timeout(self.wait_timeout, self.inflight.wait(key, &notify)).await;
                if let Some(entry) = self.index.get(key) {
                    crate::metrics::record_download_wait("ready");
                    return Ok(entry);
                }
                match waited {
                    Ok(()) => {
                        crate::metrics::record_download_wait("peer_failed");
                        Err(FetchError::PeerFailed)
                    }
                    Err(_) => {
                        crate::metrics::record_download_wait("timeout");
                        Err(FetchError::WaitTimeout)
                    }
                }
            }
            Registration::Owner(_guard) => {
                // A previous owner may have finished between the lookup and the registration.
                if let Some(entry) = self.index.get(key) {
                    return Ok(entry);
                }
                self.download(key, path).await
            }
        }
    }

    async fn download(&self, key: &CacheKey, path: &str) -> Result<Arc<CacheEntry>, FetchError> {
        let temp_path = self.store.temp_path(key);

        for attempt in 1..=self.attempts {
            let result = match timeout(
                self.attempt_timeout,
                self.download_to_temp(path, &temp_path),
            )
            .await
            {
                Ok(Ok(size)) => self.commit(key, &temp_path, size).await,
                Ok(Err(err)) => Err(err),
                Err(_) => Err(anyhow::anyhow!(
                    "origin attempt exceeded {:?}",
                    self.attempt_timeout
                )),
            };

            match result {
                Ok(entry) => {
                    crate::metrics::record_origin_attempt("success");
                    info!(
                        key = %key,
                        path,
                        size = entry.size_bytes(),
                        attempt,
                        "cached object from origin"
                    );
                    return Ok(entry);
                }
                Err(err) => {
                    crate::metrics::record_origin_attempt("failure");
                    warn!(
                        key = %key,
                        path,
                        attempt,
                        max_attempts = self.attempts,
                        error = %format!("{err:#}"),
                        "origin download attempt failed"
                    );
                    if let Err(err) = self.store.remove_file(&temp_path).await {
                        warn!(
                            path = %temp_path.display(),
                            error = %err,
                            "failed to remove temp file"
                        );
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.attempts,
        })
    }

    /// Streams one origin response into the temp file and returns its verified length.
    async fn download_to_temp(&self, path: &str, temp_path: &Path) -> Result<u64> {
        let mut response = self.origin.get(path).await?;
        ensure!(
            response.status() == StatusCode::OK,
            "origin {} answered {}",
            response.peer(),
            response.status()
        );

        let mut file = self
            .store
            .create_temp_file(temp_path)
            .await
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        let size = response.copy_body_to(&mut file).await?;
        file.flush().await.context("flushing temp file")?;
        file.sync_all().await.context("syncing temp file")?;
        Ok(size)
    }

    /// Publishes a complete temp file under its final name and indexes it.
    async fn commit(&self, key: &CacheKey, temp_path: &Path, size: u64) -> Result<Arc<CacheEntry>> {
        let final_path = self.store.entry_path(key);
        let _publish = self.publish_lock.lock().await;
        tokio::fs::rename(temp_path, &final_path)
            .await
            .with_context(|| {
                format!(
                    "failed to rename {} to {}",
                    temp_path.display(),
                    final_path.display()
                )
            })?;

        let entry = Arc::new(CacheEntry::new(key.clone(), size, SystemTime::now()));
        self.index.insert(entry.clone());
        self.evictor.trigger();
        self.publish_usage();
        Ok(entry)
    }
}
