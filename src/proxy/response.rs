use http::StatusCode;
use http::header::{ACCEPT_RANGES, ALLOW, CACHE_CONTROL, CONTENT_RANGE, CONTENT_TYPE, ETAG};

use super::cache::CacheKey;
use super::codec::HeaderLine;
use super::range::ByteRange;
use crate::mime::content_type_for_path;

const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=604800, immutable";
const X_CACHE: &str = "X-Cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Response head written to the client. The body, if any, is streamed separately.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    status: StatusCode,
    headers: Vec<HeaderLine>,
    content_length: u64,
    close: bool,
}

impl Reply {
    /// An empty-bodied reply.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            content_length: 0,
            close: false,
        }
    }

    /// A reply for a cached object, carrying the validator and caching headers.
    pub fn cached(status: StatusCode, key: &CacheKey, path: &str, cache: CacheStatus) -> Self {
        Self::new(status)
            .header(X_CACHE, cache.as_str())
            .header(CACHE_CONTROL.as_str(), IMMUTABLE_CACHE_CONTROL)
            .header(CONTENT_TYPE.as_str(), content_type_for_path(path))
            .header(ACCEPT_RANGES.as_str(), "bytes")
            .header(ETAG.as_str(), format!("\"{key}\""))
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED).header(ALLOW.as_str(), "GET")
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(HeaderLine::new(canonical_name(name), value));
        self
    }

    pub fn partial(self, range: ByteRange, size: u64) -> Self {
        self.header(CONTENT_RANGE.as_str(), range.content_range(size))
            .content_length(range.length())
    }

    /// Marks the whole object as the only satisfiable extent.
    pub fn unsatisfied_range(self, size: u64) -> Self {
        self.header(CONTENT_RANGE.as_str(), format!("bytes */{size}"))
    }

    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = length;
        self
    }

    pub fn close(mut self, close: bool) -> Self {
        self.close = close;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body_len(&self) -> u64 {
        self.content_length
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(b"HTTP/1.1 ");
        buffer.extend_from_slice(self.status.as_str().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for header in &self.headers {
            buffer.extend_from_slice(header.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(header.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        if self.status != StatusCode::NOT_MODIFIED {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(self.content_length.to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        if self.close {
            buffer.extend_from_slice(b"Connection: close\r\n");
        }

        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

/// Title-cases a lowercase header name for the wire.
fn canonical_name(name: &str) -> String {
    if name == ETAG.as_str() {
        return "ETag".to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
        upper = ch == '-';
    }
    out
}

/// Whether an `If-None-Match` value names `key`. Entries may be quoted, weak or listed.
pub(crate) fn etag_matches(if_none_match: &str, key: &CacheKey) -> bool {
    if_none_match.split(',').any(|candidate| {
        let candidate = candidate.trim();
        let candidate = candidate
            .strip_prefix("W/")
            .or_else(|| candidate.strip_prefix("w/"))
            .unwrap_or(candidate);
        let candidate = candidate.trim_matches('"').trim();
        candidate.eq_ignore_ascii_case(key.as_str())
    })
}
