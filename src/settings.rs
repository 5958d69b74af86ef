use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::origin::OriginBase;
use crate::size::parse_size;

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_client_timeout() -> u64 {
    30
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_download_attempts() -> u32 {
    3
}

fn default_download_wait_timeout_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Origin base URL; the request path is appended to it on a miss.
    #[serde(alias = "src")]
    pub source: String,
    #[serde(alias = "dir")]
    pub cache_dir: PathBuf,
    /// Disk budget as a human-readable size such as `512MB` or `10GB`.
    #[serde(alias = "maxsize")]
    pub max_size: String,
    #[serde(alias = "listento")]
    pub listen: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_download_wait_timeout_ms")]
    pub download_wait_timeout_ms: u64,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = cli.config_path() {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("PICOCACHE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = cli.config_path() {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Resolves the listen address. A bare `:port` binds every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let raw = self.listen.trim();
        ensure!(!raw.is_empty(), "listen address must not be empty");
        let candidate = if raw.starts_with(':') {
            format!("0.0.0.0{raw}")
        } else {
            raw.to_string()
        };
        if let Ok(addr) = candidate.parse::<SocketAddr>() {
            return Ok(addr);
        }
        candidate
            .to_socket_addrs()
            .with_context(|| format!("invalid listen address '{raw}'"))?
            .next()
            .ok_or_else(|| anyhow!("listen address '{raw}' did not resolve"))
    }

    pub fn max_cache_bytes(&self) -> Result<u64> {
        parse_size(&self.max_size).with_context(|| format!("invalid max_size '{}'", self.max_size))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn download_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.download_wait_timeout_ms)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if self.cache_dir.is_relative() {
            self.cache_dir = base_dir.join(&self.cache_dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        OriginBase::parse(&self.source).context("invalid source")?;
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        let max_bytes = self.max_cache_bytes()?;
        ensure!(max_bytes > 0, "max_size must be greater than 0");
        self.listen_addr()?;
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.download_attempts > 0,
            "download_attempts must be at least 1 (got {})",
            self.download_attempts
        );
        ensure!(
            self.download_wait_timeout_ms > 0,
            "download_wait_timeout_ms must be greater than 0 (got {})",
            self.download_wait_timeout_ms
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}
