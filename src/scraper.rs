//! Periodic engine-stats scraper: one background task that, every
//! `interval`, issues a bounded-concurrency `GET /metrics` against
//! every currently registered backend and records the parsed result.
//!
//! Each cycle is spawned rather than awaited inline so a slow cycle
//! never delays the next tick; a straggler response from a superseded
//! cycle can still land, but since every write is a full snapshot
//! replace this is a last-write-wins race rather than a correctness
//! hazard, consistent with scrapes being a best-effort, self-healing
//! signal.

use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use log::debug;
use thiserror::Error;

use crate::registry::BackendRegistry;
use crate::stats::{EngineStatsSnapshot, EngineStatsTable, RouterMetrics};

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONCURRENT_SCRAPES: usize = 32;

#[derive(Error, Debug)]
enum ScrapeError {
    #[error("invalid metrics uri: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),
    #[error("request build failed: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("http error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("scrape timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for ScrapeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ScrapeError::Timeout
    }
}

/// Runs the scrape loop until `shutdown` fires. Intended to be spawned
/// once at startup alongside the proxy accept loop and the config
/// watcher.
pub async fn run(
    registry: BackendRegistry,
    stats: EngineStatsTable,
    interval: Duration,
    metrics: RouterMetrics,
    mut shutdown: stream_cancel::Tripwire,
) {
    let client = Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let client = client.clone();
                let registry = registry.clone();
                let stats = stats.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    scrape_cycle(&client, &registry, &stats, &metrics).await;
                });
            }
            _ = &mut shutdown => break,
        }
    }
}

async fn scrape_cycle(
    client: &Client<HttpConnector>,
    registry: &BackendRegistry,
    stats: &EngineStatsTable,
    metrics: &RouterMetrics,
) {
    let snapshot = registry.snapshot();
    let urls: Vec<String> = snapshot.iter().map(|e| e.url.clone()).collect();

    stream::iter(urls.into_iter().map(|url| {
        let client = client.clone();
        async move {
            let result = scrape_one(&client, &url).await;
            (url, result)
        }
    }))
    .buffer_unordered(MAX_CONCURRENT_SCRAPES)
    .for_each(|(url, result)| {
        let stats = stats.clone();
        async move {
            match result {
                Ok(snapshot) => stats.record_success(&url, snapshot),
                Err(e) => {
                    debug!("scrape of {} failed: {}", url, e);
                    stats.record_failure(&url);
                    metrics.backend_scrape_failures.inc();
                }
            }
        }
    })
    .await;
}

async fn scrape_one(
    client: &Client<HttpConnector>,
    url: &str,
) -> Result<EngineStatsSnapshot, ScrapeError> {
    let uri: hyper::Uri = format!("{}/metrics", url.trim_end_matches('/')).parse()?;
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())?;

    let response = tokio::time::timeout(SCRAPE_TIMEOUT, client.request(request)).await??;
    let body = tokio::time::timeout(SCRAPE_TIMEOUT, hyper::body::to_bytes(response.into_body()))
        .await??;
    let text = String::from_utf8_lossy(&body);
    Ok(parse_metrics(&text))
}

/// Hand-rolled line-oriented Prometheus text-exposition parser,
/// extracting only the families this crate cares about. Deliberately
/// tolerant of label suffixes (`name{label="x"} value`) and of the
/// handful of naming variants real engines use for the same signal.
fn parse_metrics(text: &str) -> EngineStatsSnapshot {
    let mut pending = 0i64;
    let mut running = 0i64;
    let mut finished = 0u64;
    let mut ttft_sum = 0f64;
    let mut ttft_count = 0f64;
    let mut uptime = 0f64;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.rsplitn(2, ' ');
        let value_str = match parts.next() {
            Some(v) => v,
            None => continue,
        };
        let name_and_labels = match parts.next() {
            Some(n) => n,
            None => continue,
        };
        let value: f64 = match value_str.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let name = name_and_labels.split('{').next().unwrap_or(name_and_labels);

        if name.contains("num_requests_waiting") || name.ends_with("_pending") {
            pending = value as i64;
        } else if name.contains("num_requests_running") || name.ends_with("_running") {
            running = value as i64;
        } else if name.contains("request_success_total") || name.contains("requests_finished") {
            finished = value as u64;
        } else if name.contains("time_to_first_token_seconds_sum") {
            ttft_sum = value;
        } else if name.contains("time_to_first_token_seconds_count") {
            ttft_count = value;
        } else if name.contains("uptime") {
            uptime = value;
        }
    }

    let ttft_avg_secs = if ttft_count > 0.0 { ttft_sum / ttft_count } else { 0.0 };

    EngineStatsSnapshot {
        pending,
        running,
        finished,
        ttft_avg_secs,
        uptime_secs: uptime,
        last_scrape: Instant::now(),
        stale: false,
        consecutive_failures: 0,
    }
}
