use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramTimer, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the gateway
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Dispatcher outcomes
    requests: CounterVec,
    rate_limited: CounterVec,

    // Upstream metrics
    upstream_responses: CounterVec,
    upstream_errors: CounterVec,
    forward_duration: HistogramVec,

    // Client registry metrics
    tracked_clients: Gauge,
    evicted_clients: Counter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests = CounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Requests handled by the dispatcher by outcome",
            ),
            &["outcome"],
        )?;

        let rate_limited = CounterVec::new(
            Opts::new(
                "gateway_rate_limited_total",
                "Requests rejected by a rate limiter",
            ),
            &["tier"],
        )?;

        let upstream_responses = CounterVec::new(
            Opts::new(
                "gateway_upstream_responses_total",
                "Responses relayed from upstream services by status class",
            ),
            &["service", "class"],
        )?;

        let upstream_errors = CounterVec::new(
            Opts::new(
                "gateway_upstream_errors_total",
                "Forwarding attempts that produced no upstream response",
            ),
            &["service", "kind"],
        )?;

        let forward_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_forward_duration_seconds",
                "Time until the upstream response headers arrived",
            ),
            &["service"],
        )?;

        let tracked_clients = Gauge::new(
            "gateway_tracked_clients",
            "Clients with a live per-client bucket after the last sweep",
        )?;

        let evicted_clients = Counter::new(
            "gateway_evicted_clients_total",
            "Per-client buckets removed for being idle",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(upstream_responses.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;
        registry.register(Box::new(forward_duration.clone()))?;
        registry.register(Box::new(tracked_clients.clone()))?;
        registry.register(Box::new(evicted_clients.clone()))?;

        Ok(Self {
            registry,
            requests,
            rate_limited,
            upstream_responses,
            upstream_errors,
            forward_duration,
            tracked_clients,
            evicted_clients,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the final outcome of a dispatched request
    pub fn record_request(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    /// Record a rejection by the given limiter tier
    pub fn record_rate_limited(&self, tier: &str) {
        self.rate_limited.with_label_values(&[tier]).inc();
    }

    /// Record a relayed upstream status
    pub fn record_upstream_response(&self, service: &str, status: u16) {
        let class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.upstream_responses
            .with_label_values(&[service, class])
            .inc();
    }

    /// Record a forwarding failure (`unreachable` or `timeout`)
    pub fn record_upstream_error(&self, service: &str, kind: &str) {
        self.upstream_errors.with_label_values(&[service, kind]).inc();
    }

    /// Create a timer for measuring one forward
    pub fn start_forward_timer(&self, service: &str) -> HistogramTimer {
        self.forward_duration
            .with_label_values(&[service])
            .start_timer()
    }

    /// Record the result of a registry sweep
    pub fn record_client_sweep(&self, evicted: usize, remaining: usize) {
        self.evicted_clients.inc_by(evicted as f64);
        self.tracked_clients.set(remaining as f64);
    }
}
