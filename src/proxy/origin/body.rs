use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proxy::codec::read_line_with_timeout;
use crate::util::timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// How the end of an origin response body is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
    /// Delimited by the origin closing the connection; completeness cannot be verified.
    UntilClose,
}

/// Copies a body of exactly `length` bytes. Fewer bytes before EOF is an error.
pub(crate) async fn copy_fixed_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    length: u64,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!(
                "origin {peer} closed after {} of {length} body bytes",
                length - remaining
            );
        }
        writer
            .write_all(&buffer[..read])
            .await
            .context("writing origin body")?;
        remaining -= read as u64;
    }
    Ok(length)
}

/// Decodes a chunked body, requiring the terminating zero-size chunk. Trailers are discarded.
pub(crate) async fn copy_chunked_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = String::new();

    loop {
        let size_bytes =
            read_line_with_timeout(reader, &mut line, read_timeout, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = u64::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line_with_timeout(
                    reader,
                    &mut line,
                    read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(total);
                }
            }
        }

        copy_fixed_body(reader, writer, chunk_size, read_timeout, peer).await?;
        total = total.saturating_add(chunk_size);

        let terminator =
            read_line_with_timeout(reader, &mut line, read_timeout, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if terminator == 0 || !line.trim_end_matches(['\r', '\n']).is_empty() {
            bail!("malformed chunk terminator from {peer}");
        }
    }
}
