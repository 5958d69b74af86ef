use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One canned origin answer.
#[derive(Clone, Debug)]
pub enum OriginReply {
    Ok(Vec<u8>),
    Status(u16),
    Chunked(Vec<Vec<u8>>),
    /// Announces `declared` bytes but sends only `body` before closing.
    Truncated { declared: usize, body: Vec<u8> },
    /// No framing headers; the body ends when the connection closes.
    CloseDelimited(Vec<u8>),
}

impl OriginReply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        OriginReply::Ok(body.into())
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            OriginReply::Ok(body) => {
                let mut out = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                out.extend_from_slice(body);
                out
            }
            OriginReply::Status(status) => {
                format!("HTTP/1.1 {status} Test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .into_bytes()
            }
            OriginReply::Chunked(chunks) => {
                let mut out =
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
                        .to_vec();
                for chunk in chunks {
                    out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                    out.extend_from_slice(chunk);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"0\r\n\r\n");
                out
            }
            OriginReply::Truncated { declared, body } => {
                let mut out = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n"
                )
                .into_bytes();
                out.extend_from_slice(body);
                out
            }
            OriginReply::CloseDelimited(body) => {
                let mut out = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
                out.extend_from_slice(body);
                out
            }
        }
    }
}

/// Origin on a loopback port that counts requests and records their targets.
pub struct MockOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

pub struct MockOriginBuilder {
    script: VecDeque<OriginReply>,
    fallback: OriginReply,
    delay: Option<StdDuration>,
}

impl MockOrigin {
    /// Answers every request with `200` and `body`.
    pub async fn serving(body: impl Into<Vec<u8>>) -> Result<Self> {
        Self::builder(OriginReply::ok(body)).spawn().await
    }

    pub fn builder(fallback: OriginReply) -> MockOriginBuilder {
        MockOriginBuilder {
            script: VecDeque::new(),
            fallback,
            delay: None,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl MockOriginBuilder {
    /// Replies used in order before falling back to the default one.
    pub fn then(mut self, reply: OriginReply) -> Self {
        self.script.push_back(reply);
        self
    }

    pub fn delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn spawn(self) -> Result<MockOrigin> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let targets = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(self.script));
        let fallback = self.fallback;
        let delay = self.delay;

        let handle = {
            let requests = requests.clone();
            let targets = targets.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let requests = requests.clone();
                    let targets = targets.clone();
                    let script = script.clone();
                    let fallback = fallback.clone();
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(stream);
                        let Some(target) = read_request_target(&mut reader).await else {
                            return;
                        };
                        requests.fetch_add(1, Ordering::SeqCst);
                        targets.lock().push(target);
                        let reply = script.lock().pop_front().unwrap_or(fallback);
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        let stream = reader.get_mut();
                        let _ = stream.write_all(&reply.encode()).await;
                        let _ = stream.shutdown().await;
                    });
                }
            })
        };

        Ok(MockOrigin {
            addr,
            requests,
            targets,
            handle,
        })
    }
}

/// Reads a request head and returns its target, or `None` if the client went away first.
async fn read_request_target(reader: &mut BufReader<TcpStream>) -> Option<String> {
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let target = line.split_whitespace().nth(1)?.to_string();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) if line == "\r\n" => return Some(target),
            Ok(_) => {}
        }
    }
}
