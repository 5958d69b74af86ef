use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// How long each underlying read may block.
#[derive(Clone, Copy)]
enum ReadBound {
    PerRead(Duration),
    Deadline(Instant),
}

impl ReadBound {
    fn remaining(self, context: &str) -> Result<Duration> {
        match self {
            ReadBound::PerRead(duration) => Ok(duration),
            ReadBound::Deadline(deadline) => remaining_deadline(deadline, context),
        }
    }
}

/// Reads one line, including its terminator, with a shared deadline for the whole head.
pub(super) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_bounded_line(reader, buf, ReadBound::Deadline(deadline), peer, max_len).await
}

/// Reads one line, including its terminator, bounding each read separately.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_bounded_line(reader, buf, ReadBound::PerRead(timeout_dur), peer, max_len).await
}

async fn read_bounded_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    bound: ReadBound,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let wait = bound.remaining(&context)?;
        let available = timeout_with_context(wait, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = line.len();
    *buf = line;
    Ok(len)
}

pub(super) fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
        .ok_or_else(|| anyhow!("timed out {context}"))
}
