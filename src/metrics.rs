use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpListener,
};

use crate::proxy::codec::read_line_with_timeout;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency")
        .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("create histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register request_duration_seconds");
    histogram
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static ORIGIN_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("origin_attempts_total", "Origin fetch attempts by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_attempts_total");
    vec
});

static DOWNLOAD_WAITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "download_waits_total",
        "Requests that waited on a concurrent fetch, by outcome",
    );
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register download_waits_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_evictions_total", "Evicted cache entries").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_EVICTED_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evicted_bytes_total", "Bytes reclaimed by eviction")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evicted_bytes_total");
    counter
});

static CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_bytes", "Bytes currently cached").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_bytes");
    gauge
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("cache_entries", "Entries currently cached").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_entries");
    gauge
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_LINE_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(status: StatusCode, elapsed: Duration) {
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_origin_attempt(outcome: &str) {
    ORIGIN_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_download_wait(outcome: &str) {
    DOWNLOAD_WAITS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_eviction(removed: u64, bytes: u64) {
    CACHE_EVICTIONS_TOTAL.inc_by(removed);
    CACHE_EVICTED_BYTES_TOTAL.inc_by(bytes);
}

pub fn set_cache_usage(bytes: u64, entries: usize) {
    CACHE_BYTES.set(i64::try_from(bytes).unwrap_or(i64::MAX));
    CACHE_ENTRIES.set(i64::try_from(entries).unwrap_or(i64::MAX));
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, peer) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, peer, &path).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S, peer: SocketAddr, path: &str) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let bytes = read_line_with_timeout(
        &mut reader,
        &mut request_line,
        METRICS_READ_TIMEOUT,
        peer,
        METRICS_MAX_LINE_BYTES,
    )
    .await?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    loop {
        let mut line = String::new();
        let n = read_line_with_timeout(
            &mut reader,
            &mut line,
            METRICS_READ_TIMEOUT,
            peer,
            METRICS_MAX_LINE_BYTES,
        )
        .await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == path {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
