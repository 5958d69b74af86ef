use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_TIMEOUT: StdDuration = StdDuration::from_secs(10);

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn x_cache(&self) -> Option<&str> {
        self.header("x-cache")
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a `GET` on a fresh connection that closes after the response.
pub async fn get(addr: SocketAddr, path: &str) -> Result<HttpResponse> {
    get_with_headers(addr, path, &[]).await
}

pub async fn get_with_headers(
    addr: SocketAddr,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<HttpResponse> {
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: picocache.test\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("Connection: close\r\n\r\n");
    send_request(addr, request.as_bytes()).await
}

/// Writes raw request bytes and reads one response.
pub async fn send_request(addr: SocketAddr, request: &[u8]) -> Result<HttpResponse> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(request).await?;
    read_response(&mut reader).await
}

/// Reads one `Content-Length` framed response, leaving the connection usable.
pub async fn read_response<S>(reader: &mut BufReader<S>) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = timeout(IO_TIMEOUT, reader.read_line(&mut line)).await??;
    if read == 0 {
        return Err(anyhow!("connection closed before response status line"));
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in {line:?}"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        let read = timeout(IO_TIMEOUT, reader.read_line(&mut line)).await??;
        if read == 0 || line == "\r\n" {
            break;
        }
        let (name, value) = line
            .trim_end()
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.parse::<usize>())
        .transpose()?
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    timeout(IO_TIMEOUT, reader.read_exact(&mut body)).await??;

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
