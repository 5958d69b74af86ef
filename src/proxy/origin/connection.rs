use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use rustls::{ClientConfig, RootCertStore, crypto::ring, pki_types::ServerName};
use rustls_native_certs as native_certs;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, warn};

use super::{OriginBase, Scheme};

pub(crate) enum OriginIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for OriginIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            OriginIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            OriginIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Resolves the origin host and connects, wrapping the stream in TLS for https origins.
pub(crate) async fn connect_origin(
    base: &OriginBase,
    tls: Option<&Arc<ClientConfig>>,
    connect_timeout: Duration,
) -> Result<(OriginIo, SocketAddr)> {
    let host = base.host();
    let addrs: Vec<SocketAddr> = timeout(connect_timeout, lookup_host((host, base.port())))
        .await
        .map_err(|_| anyhow!("resolving origin host '{host}' timed out"))?
        .with_context(|| format!("failed to resolve origin host '{host}'"))?
        .collect();
    let (tcp, peer) = connect_to_addrs(&addrs, connect_timeout).await?;

    let stream = match (base.scheme(), tls) {
        (Scheme::Https, Some(config)) => {
            let server_name = ServerName::try_from(host)
                .map_err(|_| anyhow!("invalid origin host for TLS '{host}'"))?
                .to_owned();
            let connector = TlsConnector::from(config.clone());
            let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| anyhow!("TLS handshake with origin timed out"))?
                .with_context(|| format!("failed to establish TLS with origin {peer}"))?;
            OriginIo::Tls(Box::new(tls))
        }
        (Scheme::Https, None) => return Err(anyhow!("https origin requires a TLS configuration")),
        (Scheme::Http, _) => OriginIo::Plain(tcp),
    };
    Ok((stream, peer))
}

/// Tries each address in turn and returns the first established connection.
pub(crate) async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %addr, error = %err, "failed to set TCP_NODELAY on origin stream");
                }
                debug!(peer = %addr, "connected to origin");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow!(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses resolved for origin")))
}

/// Client TLS settings trusting the platform's root certificates.
pub(crate) fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder =
        ClientConfig::builder_with_provider(provider.into()).with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            debug!(added, "loaded system trust anchors");
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }
    ensure!(
        !root_store.is_empty(),
        "no trust anchors available; install system certificates to reach an https origin"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
