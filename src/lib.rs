pub mod cli;
pub mod logging;
pub mod metrics;
pub mod mime;
pub mod proxy;
pub mod settings;
pub mod size;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::{
    proxy::{
        cache::{CacheOptions, DiskCache},
        origin::{OriginBase, OriginClient, OriginOptions},
    },
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, "/metrics".to_string()).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let origin = build_origin_client(&settings)?;
    let cache = Arc::new(DiskCache::open(CacheOptions::from_settings(&settings)?, origin).await?);

    let app = proxy::AppContext::new(settings, cache);
    proxy::run(app).await
}

pub fn build_origin_client(settings: &Settings) -> Result<OriginClient> {
    let base = OriginBase::parse(&settings.source)?;
    OriginClient::new(
        base,
        OriginOptions {
            connect_timeout: settings.origin_connect_timeout(),
            io_timeout: settings.origin_timeout(),
            max_header_size: settings.max_header_size,
        },
    )
}
