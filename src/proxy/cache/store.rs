use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use filetime::FileTime;
use tokio::fs as async_fs;

use super::CacheKey;

/// Suffix reserved for files still being written. Such files are never served.
pub(super) const TEMP_SUFFIX: &str = ".tmp";

/// Flat directory layout: one file per key, named by the key.
#[derive(Debug, Clone)]
pub(super) struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub(super) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub(super) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(super) fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    pub(super) fn temp_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}{TEMP_SUFFIX}"))
    }

    pub(super) async fn ensure_dir(&self) -> Result<()> {
        async_fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))
    }

    /// Creates (or truncates) a temp file readable only by the owner.
    pub(super) async fn create_temp_file(&self, path: &Path) -> io::Result<async_fs::File> {
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        options.open(path).await
    }

    /// Deletes a file. Returns `false` when it was already gone.
    pub(super) async fn remove_file(&self, path: &Path) -> io::Result<bool> {
        match async_fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub(super) async fn set_mtime(&self, path: PathBuf, time: SystemTime) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, FileTime::from_system_time(time))
                .with_context(|| format!("failed to update mtime of {}", path.display()))
        })
        .await
        .context("mtime update task failed")?
    }
}
