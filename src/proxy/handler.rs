use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWrite;
use tracing::{debug, error, warn};

use super::AppContext;
use super::cache::{CacheEntry, CacheKey, FetchError};
use super::codec::RequestHead;
use super::range::parse_range;
use super::response::{CacheStatus, Reply, etag_matches};
use super::stream::{StreamError, stream_file, write_to_client};
use crate::logging::AccessLogBuilder;

/// Paths answered with 404 without consulting the cache or the origin.
const RESERVED_PATHS: [&str; 2] = ["/", "/favicon.ico"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ClientDisposition {
    Continue,
    Close,
}

/// What to send for one request, decided before anything is written.
struct Planned {
    reply: Reply,
    body: Option<ObjectBody>,
    cache: Option<CacheStatus>,
    error: Option<String>,
}

struct ObjectBody {
    file: File,
    entry: Arc<CacheEntry>,
    start: u64,
}

impl Planned {
    fn reply(reply: Reply) -> Self {
        Self {
            reply,
            body: None,
            cache: None,
            error: None,
        }
    }

    fn object(reply: Reply, object: ResolvedObject, start: u64) -> Self {
        Self {
            reply,
            body: Some(ObjectBody {
                file: object.file,
                entry: object.entry,
                start,
            }),
            cache: Some(object.cache),
            error: None,
        }
    }

    fn failure(status: StatusCode, cache: CacheStatus, reason: impl Into<String>) -> Self {
        Self::reply(Reply::new(status))
            .with_cache(cache)
            .with_error(reason)
    }

    fn with_cache(mut self, cache: CacheStatus) -> Self {
        self.cache = Some(cache);
        self
    }

    fn with_error(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }
}

struct ResolvedObject {
    entry: Arc<CacheEntry>,
    file: File,
    cache: CacheStatus,
}

/// Answers one parsed request. `close` is announced to the client on the response.
pub(super) async fn handle_request<W>(
    writer: &mut W,
    peer: SocketAddr,
    app: &AppContext,
    request: &RequestHead,
    close: bool,
) -> ClientDisposition
where
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let write_timeout = app.settings.client_timeout();
    let Planned {
        reply,
        body,
        cache,
        error: error_reason,
    } = plan_response(app, request).await;
    let reply = reply.close(close);

    let mut log = AccessLogBuilder::new(peer)
        .method(request.method.as_str())
        .path(request.path.clone())
        .status(reply.status());
    if let Some(range) = request.header("range") {
        log = log.range(range);
    }
    if let Some(cache) = cache {
        log = log
            .key(CacheKey::from_path(&request.path).as_str())
            .cache(cache.as_str());
    }
    if let Some(reason) = error_reason {
        log = log.error_reason(reason);
    }

    let served_entry = body.as_ref().map(|object| object.entry.clone());
    let disposition = match send(writer, &reply, body, write_timeout).await {
        Ok(sent) => {
            log = log.bytes_out(sent);
            if let Some(entry) = served_entry {
                app.cache.touch(&entry).await;
            }
            ClientDisposition::Continue
        }
        Err(err) => {
            match &err {
                StreamError::ClientGone { .. } => {
                    debug!(peer = %peer, path = %request.path, error = %err, "client disconnected");
                }
                StreamError::ClientWrite { .. } => {
                    warn!(peer = %peer, path = %request.path, error = %err, "client write failed");
                }
                StreamError::Storage { .. } => {
                    error!(
                        peer = %peer,
                        path = %request.path,
                        error = %err,
                        "failed to stream cached object"
                    );
                }
            }
            log = log.bytes_out(err.bytes_sent()).error_reason(err.to_string());
            ClientDisposition::Close
        }
    };

    log.elapsed(started.elapsed()).log();
    disposition
}

/// Writes the head and, for objects, the selected byte window. Returns body bytes sent.
async fn send<W>(
    writer: &mut W,
    reply: &Reply,
    body: Option<ObjectBody>,
    write_timeout: Duration,
) -> Result<u64, StreamError>
where
    W: AsyncWrite + Unpin,
{
    write_to_client(writer, &reply.encode(), write_timeout).await?;
    match body {
        Some(ObjectBody {
            mut file, start, ..
        }) => stream_file(&mut file, writer, start, reply.body_len(), write_timeout).await,
        None => Ok(0),
    }
}

async fn plan_response(app: &AppContext, request: &RequestHead) -> Planned {
    if request.method != Method::GET {
        return Planned::reply(Reply::method_not_allowed());
    }
    let path = request.path.as_str();
    if RESERVED_PATHS.contains(&path) {
        return Planned::reply(Reply::new(StatusCode::NOT_FOUND));
    }

    let key = CacheKey::from_path(path);
    if let Some(validator) = request.header("if-none-match")
        && etag_matches(validator, &key)
    {
        let cache = if app.cache.contains(&key) {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        };
        return Planned::reply(Reply::cached(StatusCode::NOT_MODIFIED, &key, path, cache))
            .with_cache(cache);
    }

    let object = match resolve_object(app, &key, path).await {
        Ok(object) => object,
        Err(planned) => return planned,
    };
    let size = object.entry.size_bytes();

    let Some(range_header) = request.header("range") else {
        let reply = Reply::cached(StatusCode::OK, &key, path, object.cache).content_length(size);
        return Planned::object(reply, object, 0);
    };
    match parse_range(range_header, size) {
        Ok(range) => {
            let reply = Reply::cached(StatusCode::PARTIAL_CONTENT, &key, path, object.cache)
                .partial(range, size);
            Planned::object(reply, object, range.start)
        }
        Err(err) => {
            debug!(key = %key, range = range_header, size, error = %err, "unsatisfiable range");
            let reply = Reply::cached(StatusCode::RANGE_NOT_SATISFIABLE, &key, path, object.cache)
                .unsatisfied_range(size);
            Planned::reply(reply)
                .with_cache(object.cache)
                .with_error(err.to_string())
        }
    }
}

/// Finds or downloads the object and opens its file. A hit whose file has vanished is
/// forgotten and fetched again once.
async fn resolve_object(
    app: &AppContext,
    key: &CacheKey,
    path: &str,
) -> Result<ResolvedObject, Planned> {
    if let Some(entry) = app.cache.lookup(key) {
        match File::open(app.cache.entry_path(key)).await {
            Ok(file) => {
                return Ok(ResolvedObject {
                    entry,
                    file,
                    cache: CacheStatus::Hit,
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(key = %key, path, "cached file is missing; fetching it again");
                app.cache.forget(&entry);
            }
            Err(err) => {
                error!(key = %key, path, error = %err, "failed to open cached file");
                return Err(Planned::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    CacheStatus::Hit,
                    format!("open cached file: {err}"),
                ));
            }
        }
    }

    let entry = match app.cache.fetch(key, path).await {
        Ok(entry) => entry,
        Err(err) => {
            let status = match err {
                FetchError::WaitTimeout => StatusCode::GATEWAY_TIMEOUT,
                FetchError::PeerFailed | FetchError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
            };
            error!(key = %key, path, error = %err, "failed to obtain object from origin");
            return Err(Planned::failure(status, CacheStatus::Miss, err.to_string()));
        }
    };

    match File::open(app.cache.entry_path(key)).await {
        Ok(file) => Ok(ResolvedObject {
            entry,
            file,
            cache: CacheStatus::Miss,
        }),
        Err(err) => {
            error!(key = %key, path, error = %err, "failed to open downloaded file");
            Err(Planned::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                CacheStatus::Miss,
                format!("open downloaded file: {err}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cache::tests::{open_test_cache, seed_entry};
    use crate::proxy::codec::read_request_head;
    use crate::proxy::tests::test_app;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> RequestHead {
        let mut reader = BufReader::new(raw.as_bytes());
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        read_request_head(&mut reader, peer, Duration::from_secs(1), 8192)
            .await
            .unwrap()
            .expect("request head")
    }

    async fn respond(app: &AppContext, raw: &str) -> (ClientDisposition, String) {
        let request = parse(raw).await;
        let mut out = Vec::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let disposition = handle_request(&mut out, peer, app, &request, false).await;
        (disposition, String::from_utf8_lossy(&out).into_owned())
    }

    #[tokio::test]
    async fn hit_serves_full_object_and_refreshes_last_used() {
        let dir = TempDir::new().unwrap();
        let cache = open_test_cache(dir.path(), 1024).await.unwrap();
        let key = seed_entry(&cache, "/data.bin", 16, SystemTime::UNIX_EPOCH)
            .await
            .unwrap();
        let app = test_app(cache);

        let (disposition, out) = respond(&app, "GET /data.bin HTTP/1.1\r\n\r\n").await;
        assert_eq!(disposition, ClientDisposition::Continue);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("X-Cache: HIT\r\n"));
        assert!(out.contains("Content-Length: 16\r\n"));
        assert!(out.ends_with(&"x".repeat(16)));

        let entry = app.cache.lookup(&key).unwrap();
        assert!(entry.last_used() > SystemTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn ranges_and_unsatisfiable_ranges() {
        let dir = TempDir::new().unwrap();
        let cache = open_test_cache(dir.path(), 1024).await.unwrap();
        seed_entry(&cache, "/data.bin", 16, SystemTime::now())
            .await
            .unwrap();
        let app = test_app(cache);

        let (_, out) = respond(&app, "GET /data.bin HTTP/1.1\r\nRange: bytes=-5\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{out}");
        assert!(out.contains("Content-Range: bytes 11-15/16\r\n"));
        assert!(out.ends_with("\r\n\r\nxxxxx"));

        let (disposition, out) =
            respond(&app, "GET /data.bin HTTP/1.1\r\nRange: chars=0-5\r\n\r\n").await;
        assert_eq!(disposition, ClientDisposition::Continue);
        assert!(out.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"), "{out}");
        assert!(out.contains("Content-Range: bytes */16\r\n"));
        assert!(out.contains("Content-Length: 0\r\n"));
        assert!(out.contains("X-Cache: HIT\r\n"));
        assert!(out.contains("Accept-Ranges: bytes\r\n"));
    }

    #[tokio::test]
    async fn matching_validator_short_circuits_without_origin() {
        let dir = TempDir::new().unwrap();
        let cache = open_test_cache(dir.path(), 1024).await.unwrap();
        let app = test_app(cache);
        let key = CacheKey::from_path("/never-fetched.js");

        let raw = format!("GET /never-fetched.js HTTP/1.1\r\nIf-None-Match: \"{key}\"\r\n\r\n");
        let (_, out) = respond(&app, &raw).await;
        assert!(out.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{out}");
        assert!(out.contains("X-Cache: MISS\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(app.cache.is_empty());
    }

    #[tokio::test]
    async fn reserved_paths_and_methods() {
        let dir = TempDir::new().unwrap();
        let app = test_app(open_test_cache(dir.path(), 1024).await.unwrap());

        let (_, out) = respond(&app, "HEAD /file HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{out}");
        assert!(out.contains("Allow: GET\r\n"));

        let (_, out) = respond(&app, "GET /favicon.ico HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
        let (_, out) = respond(&app, "GET /?q=1 HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
    }

    #[tokio::test]
    async fn vanished_hit_falls_back_to_origin() {
        let dir = TempDir::new().unwrap();
        let cache = open_test_cache(dir.path(), 1024).await.unwrap();
        let key = seed_entry(&cache, "/gone.bin", 8, SystemTime::now())
            .await
            .unwrap();
        std::fs::remove_file(cache.entry_path(&key)).unwrap();
        let app = test_app(cache);

        // The test origin address refuses connections, so the refetch fails.
        let (_, out) = respond(&app, "GET /gone.bin HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{out}");
        assert!(app.cache.lookup(&key).is_none());
        assert_eq!(app.cache.total_size(), 0);
    }
}
