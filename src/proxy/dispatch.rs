use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::AppContext;
use super::codec::read_request_head;
use super::handler::{ClientDisposition, handle_request};
use super::response::Reply;
use super::stream::write_to_client;
use crate::logging::AccessLogBuilder;

/// Serves requests on one client connection until either side ends it.
pub(super) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_header_size;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let started = Instant::now();
        let request =
            match read_request_head(&mut reader, peer, client_timeout, max_header_size).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) => {
                    let reason = format!("{err:#}");
                    reject_malformed(&mut writer, peer, started, client_timeout, &reason).await;
                    break;
                }
            };

        let has_body = match request.has_body() {
            Ok(has_body) => has_body,
            Err(err) => {
                let reason = format!("{err:#}");
                reject_malformed(&mut writer, peer, started, client_timeout, &reason).await;
                break;
            }
        };
        // Request bodies are never read, so the connection cannot be reused after one.
        let close = request.wants_close() || has_body;

        let disposition = handle_request(&mut writer, peer, &app, &request, close).await;
        if close || disposition == ClientDisposition::Close {
            break;
        }
    }

    writer
        .shutdown()
        .await
        .with_context(|| format!("shutting down connection to {peer}"))
}

/// Best-effort 400 for an unparseable request head. The connection is closed afterwards.
async fn reject_malformed<W>(
    writer: &mut W,
    peer: SocketAddr,
    started: Instant,
    write_timeout: Duration,
    reason: &str,
) where
    W: AsyncWrite + Unpin,
{
    debug!(peer = %peer, error = reason, "rejecting malformed request");
    let reply = Reply::new(StatusCode::BAD_REQUEST).close(true);
    let mut log = AccessLogBuilder::new(peer)
        .status(reply.status())
        .error_reason(reason);
    if let Err(err) = write_to_client(writer, &reply.encode(), write_timeout).await {
        debug!(peer = %peer, error = %err, "failed to send 400 response");
        log = log.error_reason(err.to_string());
    }
    log.elapsed(started.elapsed()).log();
}
