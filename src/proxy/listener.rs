use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{AppContext, dispatch};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    serve(listener, app).await
}

/// Accepts connections forever, one task per client.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!(
        address = %local_addr,
        cache_dir = %app.cache.dir().display(),
        max_bytes = app.cache.max_bytes(),
        "cache listener started"
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = dispatch::serve_connection(stream, peer_addr, connection_app).await {
                debug!(
                    peer = %peer_addr,
                    error = %format!("{err:#}"),
                    "connection closed with error"
                );
            }
        });
    }
}
