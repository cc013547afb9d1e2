//! Prometheus metrics registry for EnerVirgil.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and pass it
//! to the poller, the worker pool, the energy service and the HTTP
//! middleware.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Cache lookups answered from the expiring cache.
    pub cache_hits_total: Counter,
    /// Cache lookups that had to fetch.
    pub cache_misses_total: Counter,
    /// Entries currently held by the cache (sampled by the scheduler).
    pub cache_entries: Gauge,
    /// Device polls that actually reached the network.
    pub device_polls_total: Counter,
    /// Device polls that fell back to a degraded snapshot, by reason.
    pub device_poll_failures_total: CounterVec,
    /// Background jobs that failed or panicked.
    pub pool_task_failures_total: Counter,
    /// External estimate lookups issued.
    pub external_lookups_total: Counter,
    /// HTTP request count, labelled by method, path, and status code.
    pub http_requests_total: CounterVec,
    /// HTTP request latency histogram in seconds.
    pub http_request_duration: Histogram,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics. Returns an error if any metric
    /// name is invalid or duplicated.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits_total = Counter::with_opts(Opts::new(
            "enervirgil_cache_hits_total",
            "Cache lookups served from memory",
        ))?;

        let cache_misses_total = Counter::with_opts(Opts::new(
            "enervirgil_cache_misses_total",
            "Cache lookups that required a fetch",
        ))?;

        let cache_entries = Gauge::with_opts(Opts::new(
            "enervirgil_cache_entries",
            "Entries currently held by the expiring cache",
        ))?;

        let device_polls_total = Counter::with_opts(Opts::new(
            "enervirgil_device_polls_total",
            "Smart plug polls sent over the network",
        ))?;

        let device_poll_failures_total = CounterVec::new(
            Opts::new(
                "enervirgil_device_poll_failures_total",
                "Smart plug polls that returned a degraded snapshot",
            ),
            &["reason"],
        )?;

        let pool_task_failures_total = Counter::with_opts(Opts::new(
            "enervirgil_pool_task_failures_total",
            "Background jobs that failed or panicked",
        ))?;

        let external_lookups_total = Counter::with_opts(Opts::new(
            "enervirgil_external_lookups_total",
            "External search queries issued for consumption estimates",
        ))?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                "enervirgil_http_requests_total",
                "HTTP requests by method, path, and status",
            ),
            &["method", "path", "status"],
        )?;

        let http_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "enervirgil_http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(device_polls_total.clone()))?;
        registry.register(Box::new(device_poll_failures_total.clone()))?;
        registry.register(Box::new(pool_task_failures_total.clone()))?;
        registry.register(Box::new(external_lookups_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            cache_hits_total,
            cache_misses_total,
            cache_entries,
            device_polls_total,
            device_poll_failures_total,
            pool_task_failures_total,
            external_lookups_total,
            http_requests_total,
            http_request_duration,
            registry,
        })
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits_total.inc();
        } else {
            self.cache_misses_total.inc();
        }
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
