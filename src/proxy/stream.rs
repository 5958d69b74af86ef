use std::io::{self, SeekFrom};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::util::is_disconnect;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Failure while sending a cached object. The cache itself is never affected.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("client went away after {sent} bytes: {source}")]
    ClientGone {
        sent: u64,
        #[source]
        source: io::Error,
    },
    #[error("client write failed after {sent} bytes: {source}")]
    ClientWrite {
        sent: u64,
        #[source]
        source: io::Error,
    },
    #[error("reading cached object failed after {sent} bytes: {source}")]
    Storage {
        sent: u64,
        #[source]
        source: io::Error,
    },
}

impl StreamError {
    pub fn bytes_sent(&self) -> u64 {
        match self {
            StreamError::ClientGone { sent, .. }
            | StreamError::ClientWrite { sent, .. }
            | StreamError::Storage { sent, .. } => *sent,
        }
    }

    fn from_write(sent: u64, source: io::Error) -> Self {
        if is_disconnect(&source) || source.kind() == io::ErrorKind::TimedOut {
            StreamError::ClientGone { sent, source }
        } else {
            StreamError::ClientWrite { sent, source }
        }
    }
}

/// Writes and flushes `bytes`, treating a stalled peer as gone.
pub(crate) async fn write_to_client<W>(
    writer: &mut W,
    bytes: &[u8],
    write_timeout: Duration,
) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    timed_write(writer, bytes, write_timeout)
        .await
        .map_err(|source| StreamError::from_write(0, source))?;
    timed_flush(writer, write_timeout)
        .await
        .map_err(|source| StreamError::from_write(0, source))
}

/// Sends `len` bytes of `file` starting at `start` and flushes. Returns the byte count sent.
pub(crate) async fn stream_file<F, W>(
    file: &mut F,
    writer: &mut W,
    start: u64,
    len: u64,
    write_timeout: Duration,
) -> Result<u64, StreamError>
where
    F: AsyncRead + AsyncSeek + Unpin,
    W: AsyncWrite + Unpin,
{
    if start > 0 {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|source| StreamError::Storage { sent: 0, source })?;
    }

    let mut sent = 0u64;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    while sent < len {
        let to_read = (len - sent).min(buffer.len() as u64) as usize;
        let read = file
            .read(&mut buffer[..to_read])
            .await
            .map_err(|source| StreamError::Storage { sent, source })?;
        if read == 0 {
            return Err(StreamError::Storage {
                sent,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("cached object ended after {sent} of {len} bytes"),
                ),
            });
        }
        timed_write(writer, &buffer[..read], write_timeout)
            .await
            .map_err(|source| StreamError::from_write(sent, source))?;
        sent += read as u64;
    }

    timed_flush(writer, write_timeout)
        .await
        .map_err(|source| StreamError::from_write(sent, source))?;
    Ok(sent)
}

async fn timed_write<W>(writer: &mut W, bytes: &[u8], write_timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(write_timeout, writer.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(timed_out()),
    }
}

async fn timed_flush<W>(writer: &mut W, write_timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(write_timeout, writer.flush()).await {
        Ok(result) => result,
        Err(_) => Err(timed_out()),
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "client write timed out")
}
