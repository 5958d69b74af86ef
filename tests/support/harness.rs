use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use picocache::{
    build_origin_client,
    cli::LogFormat,
    proxy::{
        AppContext,
        cache::{CacheKey, CacheOptions, DiskCache},
        listener,
    },
    settings::Settings,
};

fn default_test_settings(source: &str, cache_dir: &Path) -> Settings {
    Settings {
        source: source.to_string(),
        cache_dir: cache_dir.to_path_buf(),
        max_size: "16MB".to_string(),
        listen: "127.0.0.1:0".to_string(),
        log: LogFormat::Text,
        client_timeout: 10,
        origin_connect_timeout: 2,
        origin_timeout: 5,
        max_header_size: 32 * 1024,
        download_attempts: 3,
        download_wait_timeout_ms: 3_000,
        metrics_listen: None,
    }
}

pub struct CacheHarness {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    pub cache: Arc<DiskCache>,
    _temp: Option<TempDir>,
    handle: JoinHandle<()>,
}

impl CacheHarness {
    pub fn entry_path(&self, path: &str) -> PathBuf {
        self.cache.entry_path(&CacheKey::from_path(path))
    }

    /// Names of every file currently in the cache directory.
    pub fn cache_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct CacheHarnessBuilder {
    source: String,
    cache_dir: Option<PathBuf>,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl CacheHarnessBuilder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            cache_dir: None,
            settings_override: None,
        }
    }

    /// Uses an existing directory instead of a fresh temporary one.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<CacheHarness> {
        let (temp, cache_dir) = match self.cache_dir.take() {
            Some(dir) => (None, dir),
            None => {
                let temp = TempDir::new()?;
                let dir = temp.path().join("cache");
                (Some(temp), dir)
            }
        };

        let mut settings = default_test_settings(&self.source, &cache_dir);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        settings.validate()?;
        let settings = Arc::new(settings);

        let origin = build_origin_client(&settings)?;
        let options = CacheOptions::from_settings(&settings)?;
        let cache = Arc::new(DiskCache::open(options, origin).await?);

        let listener = TcpListener::bind(settings.listen_addr()?).await?;
        let addr = listener.local_addr()?;
        let app = AppContext::new(settings, cache.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = listener::serve(listener, app).await {
                tracing::error!(error = ?err, "cache listener failed");
            }
        });

        Ok(CacheHarness {
            addr,
            cache_dir,
            cache,
            _temp: temp,
            handle,
        })
    }
}
