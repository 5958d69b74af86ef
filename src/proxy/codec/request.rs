use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::HeaderBlock;
use super::line::read_line_with_deadline;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    /// Raw origin-form path without query string.
    pub path: String,
    pub version: Version,
    pub headers: HeaderBlock,
}

impl RequestHead {
    /// Whether the client expects the connection to end after this response.
    pub fn wants_close(&self) -> bool {
        match self.version {
            Version::HTTP_10 => !self.headers.has_token("connection", "keep-alive"),
            _ => self.headers.has_token("connection", "close"),
        }
    }

    /// A request body would have to be drained before the next head; such requests close instead.
    pub fn has_body(&self) -> Result<bool> {
        if self.headers.has_transfer_encoding() {
            return Ok(true);
        }
        Ok(self.headers.content_length()?.is_some_and(|len| len > 0))
    }

    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers.get(lower_name)
    }
}

/// Reads one request head. Returns `None` when the client closes or stays idle past
/// `idle_timeout` before sending anything.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max request header size must be greater than zero"
    );
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + idle_timeout;
    let mut headers = HeaderBlock::new(max_header_bytes)?;
    let mut request_line = String::new();
    let read =
        read_line_with_deadline(reader, &mut request_line, deadline, peer, max_header_bytes)
            .await?;
    if read == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    headers.reserve(read)?;
    let request_line = request_line.trim_end_matches(['\r', '\n']);
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let (method, target, version) = parse_request_line(request_line)?;
    let path = origin_form_path(&target)?;

    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, max_header_bytes)
                .await?;
        if read == 0 {
            bail!("connection closed while reading headers from {peer}");
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        path,
        version,
        headers,
    }))
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    Ok((method, target.to_string(), version))
}

/// Extracts the path of an origin-form or absolute-form target, dropping the query.
fn origin_form_path(target: &str) -> Result<String> {
    let path_and_query = if target.starts_with('/') {
        target
    } else if let Some((_, rest)) = target.split_once("://") {
        rest.find('/').map(|idx| &rest[idx..]).unwrap_or("/")
    } else {
        bail!("unsupported request target '{target}'");
    };
    let path = path_and_query
        .split_once(['?', '#'])
        .map(|(path, _)| path)
        .unwrap_or(path_and_query);
    ensure!(
        path.bytes().all(|byte| byte.is_ascii_graphic()),
        "request path contains invalid characters"
    );
    Ok(path.to_string())
}
