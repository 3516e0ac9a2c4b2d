use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{Encoder, Registry, TextEncoder};

pub const SEP: &str = ":";

/// A wrapped stats implementation, split into a `Collector`/`Scope`
/// pair: all types are clone-able and continue
/// to refer to the same underlying Prometheus metric. Scopes can be
/// cloned but do not share lineage; sub-scopes are independent.
/// Building a reference to the same counter name returns the same
/// underlying atomic.
#[derive(Clone, Debug)]
pub struct Collector {
    registry: Registry,
    counters: Arc<DashMap<String, Counter>>,
    gauges: Arc<DashMap<String, Gauge>>,
}

impl Default for Collector {
    fn default() -> Self {
        Collector {
            registry: Registry::new(),
            counters: Arc::new(DashMap::new()),
            gauges: Arc::new(DashMap::new()),
        }
    }
}

impl Collector {
    pub fn scope(&self, prefix: &str) -> Scope {
        Scope {
            collector: self.clone(),
            scope: String::from(prefix),
        }
    }

    /// Generate and return a byte buffer containing a Prometheus
    /// formatted text output of this collector's current contents. The
    /// HTTP `/metrics` endpoint is a passive reader of this buffer.
    pub fn prometheus_output(&self) -> anyhow::Result<Vec<u8>> {
        let output = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&output, &mut buffer)?;
        Ok(buffer)
    }

    fn register_counter(&self, c: Counter) -> anyhow::Result<Counter> {
        let counter = match self.counters.get(&c.name) {
            Some(counter) => counter.clone(),
            None => {
                self.registry.register(Box::new(c.clone().counter))?;
                self.counters.insert(c.name.clone(), c.clone());
                c
            }
        };
        Ok(counter)
    }

    fn register_gauge(&self, g: Gauge) -> anyhow::Result<Gauge> {
        let gauge = match self.gauges.get(&g.name) {
            Some(gauge) => gauge.clone(),
            None => {
                self.registry.register(Box::new(g.clone().gauge))?;
                self.gauges.insert(g.name.clone(), g.clone());
                g
            }
        };
        Ok(gauge)
    }
}

#[derive(Clone, Debug)]
pub struct Scope {
    collector: Collector,
    scope: String,
}

impl Scope {
    pub fn scope(&self, extend: &str) -> Scope {
        Scope {
            scope: format!("{}{}{}", self.scope, SEP, extend),
            collector: self.collector.clone(),
        }
    }

    pub fn counter(&self, name: &str) -> anyhow::Result<Counter> {
        let name = format!("{}{}{}", self.scope, SEP, name);
        let counter = Counter::new(name)?;
        self.collector.register_counter(counter)
    }

    pub fn gauge(&self, name: &str) -> anyhow::Result<Gauge> {
        let name = format!("{}{}{}", self.scope, SEP, name);
        let gauge = Gauge::new(name.as_str())?;
        self.collector.register_gauge(gauge)
    }
}

#[derive(Clone, Debug)]
pub struct Gauge {
    name: String,
    gauge: prometheus::Gauge,
}

impl Gauge {
    fn new(name: &str) -> anyhow::Result<Self> {
        let pg = prometheus::Gauge::new(name.to_owned(), "a gauge")?;
        Ok(Self {
            name: name.to_owned(),
            gauge: pg,
        })
    }

    pub fn set(&self, value: f64) {
        self.gauge.set(value)
    }

    pub fn get(&self) -> f64 {
        self.gauge.get()
    }
}

#[derive(Clone, Debug)]
pub struct Counter {
    name: String,
    counter: prometheus::Counter,
}

impl Counter {
    fn new(name: String) -> anyhow::Result<Self> {
        let pcounter = prometheus::Counter::new(name.clone(), "a counter")?;
        Ok(Self {
            name,
            counter: pcounter,
        })
    }

    pub fn inc(&self) {
        self.counter.inc();
    }

    pub fn inc_by(&self, value: f64) {
        self.counter.inc_by(value);
    }

    pub fn get(&self) -> f64 {
        self.counter.get()
    }
}

/// Router-internal counters and gauges the rest of the crate
/// increments or sets on real events, registered once at startup
/// against a shared `Collector` and cloned into every subsystem that
/// needs to report through it.
#[derive(Clone, Debug)]
pub struct RouterMetrics {
    /// Incremented every time a `/metrics` scrape against a backend
    /// fails (timeout, connection refused, non-UTF8 body).
    pub backend_scrape_failures: Counter,
    /// Incremented every time a proxied request fails to connect to or
    /// times out against its chosen backend.
    pub upstream_connect_failures: Counter,
    /// Incremented every time a client disconnects before a streamed
    /// response finishes. Not an error: tracked separately from
    /// `upstream_connect_failures` per the stats-conservation invariant
    /// (`started - finished - client_aborted = in_flight`).
    pub client_aborted: Counter,
    /// Current size of the backend registry, set whenever a new
    /// discovery snapshot is published.
    pub registered_backends: Gauge,
}

impl RouterMetrics {
    pub fn new(collector: &Collector) -> anyhow::Result<Self> {
        let scope = collector.scope("router");
        Ok(RouterMetrics {
            backend_scrape_failures: scope.counter("backend_scrape_failures")?,
            upstream_connect_failures: scope.counter("upstream_connect_failures")?,
            client_aborted: scope.counter("client_aborted")?,
            registered_backends: scope.gauge("registered_backends")?,
        })
    }
}

/// The result of scraping a backend's `/metrics` endpoint, keyed by
/// backend URL. Mutated only by the scraper (`crate::scraper`);
/// read-only to routing policies.
#[derive(Debug, Clone)]
pub struct EngineStatsSnapshot {
    pub pending: i64,
    pub running: i64,
    pub finished: u64,
    pub ttft_avg_secs: f64,
    pub uptime_secs: f64,
    pub last_scrape: Instant,
    /// Set when the most recent scrape failed or none has completed
    /// yet. A stale snapshot is still selectable, but policies may
    /// prefer non-stale endpoints (`LeastLoaded` always does).
    pub stale: bool,
    pub consecutive_failures: u32,
}

impl Default for EngineStatsSnapshot {
    fn default() -> Self {
        EngineStatsSnapshot {
            pending: 0,
            running: 0,
            finished: 0,
            ttft_avg_secs: 0.0,
            uptime_secs: 0.0,
            last_scrape: Instant::now(),
            stale: true,
            consecutive_failures: 0,
        }
    }
}

/// Holds the most recent scrape outcome for every known backend.
#[derive(Clone, Default)]
pub struct EngineStatsTable {
    inner: Arc<DashMap<String, EngineStatsSnapshot>>,
}

impl EngineStatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a backend's snapshot atomically after a successful scrape.
    pub fn record_success(&self, url: &str, snapshot: EngineStatsSnapshot) {
        self.inner.insert(url.to_string(), snapshot);
    }

    /// Flag the backend's existing snapshot stale after a failed
    /// scrape. The endpoint stays registered and selectable.
    pub fn record_failure(&self, url: &str) {
        let mut entry = self
            .inner
            .entry(url.to_string())
            .or_insert_with(EngineStatsSnapshot::default);
        entry.stale = true;
        entry.consecutive_failures += 1;
        entry.last_scrape = Instant::now();
    }

    pub fn get(&self, url: &str) -> Option<EngineStatsSnapshot> {
        self.inner.get(url).map(|r| r.clone())
    }

    pub fn remove(&self, url: &str) {
        self.inner.remove(url);
    }
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    epoch_second: u64,
    started: u64,
    finished: u64,
    latency_sum_micros: u64,
}

/// The ring holds exactly `window_secs` buckets: the configured window
/// is the source of truth for the ring's size, not a fixed cap, so a
/// `--request-stats-window` larger than the old 300s default is
/// honored rather than silently truncated.
struct RequestStatsInner {
    window_secs: u64,
    buckets: Vec<Bucket>,
}

impl RequestStatsInner {
    fn new(window_secs: u64) -> Self {
        let window_secs = window_secs.max(1);
        RequestStatsInner {
            window_secs,
            buckets: vec![Bucket::default(); window_secs as usize],
        }
    }

    fn bucket_mut(&mut self, epoch_second: u64) -> &mut Bucket {
        let idx = (epoch_second as usize) % self.buckets.len();
        let bucket = &mut self.buckets[idx];
        if bucket.epoch_second != epoch_second {
            *bucket = Bucket {
                epoch_second,
                started: 0,
                finished: 0,
                latency_sum_micros: 0,
            };
        }
        bucket
    }

    fn window_counts(&self, now_epoch_second: u64) -> (u64, u64, u64) {
        let floor = now_epoch_second.saturating_sub(self.window_secs - 1);
        let mut started = 0u64;
        let mut finished = 0u64;
        let mut latency_sum = 0u64;
        for bucket in self.buckets.iter() {
            if bucket.epoch_second >= floor && bucket.epoch_second <= now_epoch_second {
                started += bucket.started;
                finished += bucket.finished;
                latency_sum += bucket.latency_sum_micros;
            }
        }
        (started, finished, latency_sum)
    }
}

/// Per-backend sliding window of in-flight/recently-completed request
/// counts, implemented as a ring of 1-second buckets. `in_flight` is
/// the instantaneous truth and is not part of the window.
pub struct BackendRequestStats {
    epoch: Instant,
    in_flight: AtomicI64,
    total_started: AtomicU64,
    total_finished: AtomicU64,
    total_aborted: AtomicU64,
    ring: Mutex<RequestStatsInner>,
}

impl BackendRequestStats {
    fn new(window_secs: u64) -> Self {
        BackendRequestStats {
            epoch: Instant::now(),
            in_flight: AtomicI64::new(0),
            total_started: AtomicU64::new(0),
            total_finished: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            ring: Mutex::new(RequestStatsInner::new(window_secs)),
        }
    }

    fn now_epoch_second(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Call on request dispatch.
    pub fn start(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
        let second = self.now_epoch_second();
        self.ring.lock().bucket_mut(second).started += 1;
    }

    /// Call on successful response close.
    pub fn finish(&self, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_finished.fetch_add(1, Ordering::Relaxed);
        let second = self.now_epoch_second();
        let mut ring = self.ring.lock();
        let bucket = ring.bucket_mut(second);
        bucket.finished += 1;
        bucket.latency_sum_micros += latency.as_micros() as u64;
    }

    /// Call when the client disconnects before the response completes.
    /// Not counted as a finish, not counted as an error.
    pub fn abort(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    pub fn total_finished(&self) -> u64 {
        self.total_finished.load(Ordering::Relaxed)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }

    /// Counts restricted to the last `window_secs` seconds:
    /// `(started, finished, latency_sum)`.
    pub fn window(&self) -> (u64, u64, Duration) {
        let second = self.now_epoch_second();
        let (started, finished, latency_sum_micros) = self.ring.lock().window_counts(second);
        (started, finished, Duration::from_micros(latency_sum_micros))
    }
}

/// Per-backend request-stats table, created lazily on first use.
#[derive(Clone)]
pub struct RequestStatsTable {
    window_secs: u64,
    inner: Arc<DashMap<String, Arc<BackendRequestStats>>>,
}

impl RequestStatsTable {
    pub fn new(window_secs: u64) -> Self {
        RequestStatsTable {
            window_secs,
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, url: &str) -> Arc<BackendRequestStats> {
        self.inner
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(BackendRequestStats::new(self.window_secs)))
            .clone()
    }

    pub fn remove(&self, url: &str) {
        self.inner.remove(url);
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    pub fn test_counter() {
        let collector = Collector::default();
        let scope = collector.scope("prefix");
        let ctr1 = scope.counter("counter").unwrap();
        ctr1.inc();
        let ctr2 = scope.counter("counter").unwrap();
        assert_eq!(ctr2.get(), 1_f64);
        ctr2.inc();
        assert_eq!(ctr1.get(), 2_f64);
    }

    #[test]
    pub fn test_gauge() {
        let collector = Collector::default();
        let scope = collector.scope("prefix");
        let ctr1 = scope.gauge("gauge").unwrap();
        ctr1.set(12_f64);
        let ctr2 = scope.gauge("gauge").unwrap();
        assert_eq!(ctr2.get(), 12_f64);
        ctr2.set(13_f64);
        assert_eq!(ctr1.get(), 13_f64);
    }

    #[test]
    fn request_stats_conservation() {
        let stats = BackendRequestStats::new(60);
        stats.start();
        stats.start();
        stats.finish(Duration::from_millis(10));
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.total_started(), 2);
        assert_eq!(stats.total_finished(), 1);
        assert_eq!(stats.total_aborted(), 0);

        stats.abort();
        assert_eq!(stats.in_flight(), 0);
        // started - finished - aborted == in_flight at this quiescent moment
        assert_eq!(
            stats.total_started() - stats.total_finished() - stats.total_aborted(),
            stats.in_flight() as u64
        );
    }

    #[test]
    fn request_stats_window_reflects_recent_activity() {
        let stats = BackendRequestStats::new(60);
        stats.start();
        stats.finish(Duration::from_millis(5));
        let (started, finished, _latency) = stats.window();
        assert_eq!(started, 1);
        assert_eq!(finished, 1);
    }

    #[test]
    fn engine_stats_table_records_success_and_failure() {
        let table = EngineStatsTable::new();
        table.record_success(
            "http://a",
            EngineStatsSnapshot {
                pending: 0,
                running: 1,
                finished: 10,
                ttft_avg_secs: 0.2,
                uptime_secs: 100.0,
                last_scrape: Instant::now(),
                stale: false,
                consecutive_failures: 0,
            },
        );
        let snap = table.get("http://a").unwrap();
        assert!(!snap.stale);
        assert_eq!(snap.running, 1);

        table.record_failure("http://a");
        let snap = table.get("http://a").unwrap();
        assert!(snap.stale);
        assert_eq!(snap.consecutive_failures, 1);
    }

    #[test]
    fn router_metrics_counters_are_independent_and_persist_across_clones() {
        let collector = Collector::default();
        let metrics = RouterMetrics::new(&collector).unwrap();
        metrics.upstream_connect_failures.inc();
        metrics.client_aborted.inc();
        metrics.client_aborted.inc();
        metrics.registered_backends.set(3.0);

        let cloned = metrics.clone();
        assert_eq!(cloned.upstream_connect_failures.get(), 1.0);
        assert_eq!(cloned.client_aborted.get(), 2.0);
        assert_eq!(cloned.backend_scrape_failures.get(), 0.0);
        assert_eq!(cloned.registered_backends.get(), 3.0);

        let output = collector.prometheus_output().unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("router:upstream_connect_failures"));
        assert!(text.contains("router:registered_backends"));
    }
}
