//! Minimal HTTP/1.1 client for fetching objects from the configured origin.

mod body;
mod connection;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{StatusCode, Uri};
use rustls::ClientConfig;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::proxy::codec::read_response_head;
use crate::util::timeout_with_context;

pub use body::BodyFraming;
use connection::{OriginIo, build_tls_client_config, connect_origin};

const USER_AGENT: &str = concat!("picocache/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Parsed origin base URL. Request paths are appended to `base_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginBase {
    scheme: Scheme,
    host: String,
    port: u16,
    explicit_port: bool,
    base_path: String,
}

impl OriginBase {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        ensure!(!raw.is_empty(), "origin URL must not be empty");
        let uri: Uri = raw
            .parse()
            .with_context(|| format!("invalid origin URL '{raw}'"))?;
        let scheme = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(other) => bail!("unsupported origin scheme '{other}'"),
            None => bail!("origin URL '{raw}' must start with http:// or https://"),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("origin URL '{raw}' is missing a host"))?;
        ensure!(
            !authority.as_str().contains('@'),
            "origin URL must not carry credentials"
        );
        ensure!(uri.query().is_none(), "origin URL must not carry a query");
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        ensure!(!host.is_empty(), "origin URL '{raw}' is missing a host");
        let port = authority.port_u16();

        Ok(Self {
            scheme,
            host,
            port: port.unwrap_or_else(|| scheme.default_port()),
            explicit_port: port.is_some(),
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Origin-form target for a request path.
    pub fn request_target(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_path)
        } else {
            format!("{}/{path}", self.base_path)
        }
    }

    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.explicit_port && self.port != self.scheme.default_port() {
            format!("{host}:{}", self.port)
        } else {
            host
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OriginOptions {
    pub connect_timeout: Duration,
    /// Bound on each individual read or write against the origin.
    pub io_timeout: Duration,
    pub max_header_size: usize,
}

pub struct OriginClient {
    base: OriginBase,
    options: OriginOptions,
    tls: Option<Arc<ClientConfig>>,
}

impl OriginClient {
    pub fn new(base: OriginBase, options: OriginOptions) -> Result<Self> {
        let tls = match base.scheme() {
            Scheme::Https => Some(build_tls_client_config()?),
            Scheme::Http => None,
        };
        Ok(Self { base, options, tls })
    }

    pub fn base(&self) -> &OriginBase {
        &self.base
    }

    /// Issues `GET <base><path>` and returns once the response head has been read.
    pub async fn get(&self, path: &str) -> Result<OriginResponse> {
        let (mut stream, peer) =
            connect_origin(&self.base, self.tls.as_ref(), self.options.connect_timeout).await?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\nAccept-Encoding: identity\r\nConnection: close\r\n\r\n",
            self.base.request_target(path),
            self.base.host_header(),
        );
        timeout_with_context(
            self.options.io_timeout,
            stream.write_all(request.as_bytes()),
            "sending request to origin",
        )
        .await?;
        timeout_with_context(
            self.options.io_timeout,
            stream.flush(),
            "flushing origin stream",
        )
        .await?;

        let mut reader = BufReader::new(stream);
        let head = read_response_head(
            &mut reader,
            self.options.io_timeout,
            peer,
            self.options.max_header_size,
        )
        .await?;
        let framing = if head.chunked {
            BodyFraming::Chunked
        } else if let Some(length) = head.content_length {
            BodyFraming::Length(length)
        } else {
            BodyFraming::UntilClose
        };
        debug!(
            peer = %peer,
            status = head.status.as_u16(),
            version = ?head.version,
            content_type = head.headers.get("content-type"),
            framing = ?framing,
            "origin response head received"
        );

        Ok(OriginResponse {
            status: head.status,
            framing,
            reader,
            peer,
            read_timeout: self.options.io_timeout,
        })
    }
}

pub struct OriginResponse {
    status: StatusCode,
    framing: BodyFraming,
    reader: BufReader<OriginIo>,
    peer: SocketAddr,
    read_timeout: Duration,
}

impl OriginResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Copies the complete body into `writer` and returns the byte count. Fails unless the
    /// body is provably complete.
    pub async fn copy_body_to<W>(&mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self.framing {
            BodyFraming::Length(length) => {
                body::copy_fixed_body(&mut self.reader, writer, length, self.read_timeout, self.peer)
                    .await
            }
            BodyFraming::Chunked => {
                body::copy_chunked_body(&mut self.reader, writer, self.read_timeout, self.peer)
                    .await
            }
            BodyFraming::UntilClose => {
                bail!("origin response has no length or chunked framing; refusing to cache")
            }
        }
    }
}
