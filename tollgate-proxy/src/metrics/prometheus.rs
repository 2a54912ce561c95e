//! Prometheus metrics for the Tollgate gateway
//!
//! Exposes metrics in Prometheus format for monitoring and observability.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tollgate_core::{QueueStatus, TokenUsage};

lazy_static! {
    /// Global Prometheus registry for Tollgate metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Total chat requests with model and status labels
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of chat completion requests")
            .namespace("tollgate"),
        &["model", "status"]
    ).expect("metric can be created");

    /// Time from submission until the upstream answered (or the stream ended)
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Upstream request duration in seconds"
        )
        .namespace("tollgate")
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"]
    ).expect("metric can be created");

    // ============== Token Metrics ==============

    /// Tokens written to the usage ledger, by model and kind
    pub static ref TOKENS_RECORDED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("tokens_recorded_total", "Total tokens recorded in the usage ledger")
            .namespace("tollgate"),
        &["model", "kind"]
    ).expect("metric can be created");

    /// Usage records that could not be written
    pub static ref USAGE_RECORD_FAILURES_TOTAL: Counter = Counter::with_opts(
        Opts::new("usage_record_failures_total", "Usage records that failed to persist")
            .namespace("tollgate")
    ).expect("metric can be created");

    // ============== Queue Metrics ==============

    /// Current queue size gauge
    pub static ref QUEUE_SIZE: Gauge = Gauge::with_opts(
        Opts::new("queue_size", "Current number of requests waiting for a slot")
            .namespace("tollgate")
    ).expect("metric can be created");

    /// Queue wait time histogram
    pub static ref QUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "queue_wait_seconds",
            "Time spent waiting for an execution slot"
        )
        .namespace("tollgate")
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).expect("metric can be created");

    /// Slots currently held
    pub static ref ACTIVE_SLOTS: Gauge = Gauge::with_opts(
        Opts::new("active_slots", "Number of execution slots currently held")
            .namespace("tollgate")
    ).expect("metric can be created");

    /// Maximum concurrent requests gauge
    pub static ref MAX_CONCURRENT_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("max_concurrent_requests", "Maximum concurrent upstream requests allowed")
            .namespace("tollgate")
    ).expect("metric can be created");

    // ============== Shedding Metrics ==============

    /// Requests rejected counter (queue full)
    pub static ref REQUESTS_REJECTED_TOTAL: Counter = Counter::with_opts(
        Opts::new("requests_rejected_total", "Total requests rejected due to queue full")
            .namespace("tollgate")
    ).expect("metric can be created");

    /// Requests denied by a token cap, by cap
    pub static ref RATE_LIMITED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("rate_limited_total", "Total requests denied by a token rate limit")
            .namespace("tollgate"),
        &["reason"]
    ).expect("metric can be created");

    // ============== Backend Metrics ==============

    /// Ollama backend health status (1 = healthy, 0 = unhealthy)
    pub static ref BACKEND_HEALTHY: Gauge = Gauge::with_opts(
        Opts::new("backend_healthy", "Backend health status (1=healthy, 0=unhealthy)")
            .namespace("tollgate")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;

    REGISTRY.register(Box::new(TOKENS_RECORDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(USAGE_RECORD_FAILURES_TOTAL.clone()))?;

    REGISTRY.register(Box::new(QUEUE_SIZE.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SLOTS.clone()))?;
    REGISTRY.register(Box::new(MAX_CONCURRENT_REQUESTS.clone()))?;

    REGISTRY.register(Box::new(REQUESTS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMITED_TOTAL.clone()))?;

    REGISTRY.register(Box::new(BACKEND_HEALTHY.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Tracks one admitted request. Dropping it without recording an outcome
/// counts the request as an error.
pub struct RequestTimer {
    model: String,
    start: std::time::Instant,
    finished: bool,
}

impl RequestTimer {
    /// Start a new request timer for the given model.
    pub fn new(model: &str) -> Self {
        Self { model: model.to_string(), start: std::time::Instant::now(), finished: false }
    }

    /// Record a successful request completion.
    pub fn record_success(mut self) {
        self.finish("success");
    }

    /// Record a failed request.
    pub fn record_failure(mut self) {
        self.finish("error");
    }

    fn finish(&mut self, status: &str) {
        if self.finished {
            return;
        }
        self.finished = true;

        REQUEST_DURATION_SECONDS
            .with_label_values(&[&self.model])
            .observe(self.start.elapsed().as_secs_f64());
        REQUESTS_TOTAL
            .with_label_values(&[&self.model, status])
            .inc();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.finish("error");
    }
}

/// Mirror a queue snapshot into the gauges.
pub fn observe_queue(status: &QueueStatus) {
    QUEUE_SIZE.set(status.queued as f64);
    ACTIVE_SLOTS.set(status.active as f64);
    MAX_CONCURRENT_REQUESTS.set(status.max_concurrency as f64);
}

/// Record queue wait time.
pub fn record_queue_wait(waited: Duration) {
    QUEUE_WAIT_SECONDS.observe(waited.as_secs_f64());
}

/// Record a rejected request.
pub fn record_rejected() {
    REQUESTS_REJECTED_TOTAL.inc();
}

/// Record a request denied by a token cap.
pub fn record_rate_limited(reason: &str) {
    RATE_LIMITED_TOTAL.with_label_values(&[reason]).inc();
}

/// Record tokens written to the ledger.
pub fn record_usage(model: &str, usage: &TokenUsage) {
    TOKENS_RECORDED_TOTAL
        .with_label_values(&[model, "prompt"])
        .inc_by(usage.prompt_tokens as f64);
    TOKENS_RECORDED_TOTAL
        .with_label_values(&[model, "completion"])
        .inc_by(usage.completion_tokens as f64);
}

/// Record a usage write that failed.
pub fn record_usage_failure() {
    USAGE_RECORD_FAILURES_TOTAL.inc();
}

/// Set backend health status.
pub fn set_backend_healthy(healthy: bool) {
    BACKEND_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}
