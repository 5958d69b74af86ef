use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use super::headers::HeaderBlock;
use super::line::read_line_with_timeout;

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderBlock,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Reads an origin response head. HTTP/1.0 and HTTP/1.1 are accepted; a head declaring both
/// `Transfer-Encoding` and `Content-Length` is rejected.
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut headers = HeaderBlock::new(max_header_bytes)?;
    let mut status_line = String::new();
    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("origin closed connection before sending status line");
    }
    headers.reserve(bytes)?;
    let (version, status) = parse_status_line(status_line.trim_end_matches(['\r', '\n']))?;

    let mut header_line = String::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut header_line,
            timeout_dur,
            peer,
            max_header_bytes,
        )
        .await?;
        if read == 0 {
            bail!("origin closed connection during headers");
        }
        if !headers
            .push_line(&header_line)
            .context("invalid header from origin")?
        {
            break;
        }
    }

    let content_length = headers.content_length()?;
    let transfer_encoding = headers.has_transfer_encoding();
    if transfer_encoding && content_length.is_some() {
        warn!(
            peer = %peer,
            "origin response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("origin response must not include both Transfer-Encoding and Content-Length");
    }
    let chunked = headers.is_chunked();

    Ok(ResponseHead {
        version,
        status,
        headers,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing HTTP version"))?;
    let status = parts
        .next()
        .filter(|status| !status.is_empty())
        .ok_or_else(|| anyhow!("origin status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported origin HTTP version '{other}'"),
    };
    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid origin status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported origin status code '{status_code}'"))?;
    Ok((version, status))
}
