// Prometheus metrics for the instance client.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Interval pollers currently running.
    pub static ref ACTIVE_POLLERS: IntGauge =
        IntGauge::new("ptactl_active_pollers", "Interval pollers currently running").unwrap();

    /// Open realtime sessions, one per connected endpoint.
    pub static ref REALTIME_CONNECTED: IntGauge = IntGauge::new(
        "ptactl_realtime_connected",
        "Open realtime WebSocket sessions across all endpoints"
    )
    .unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Backend requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ptactl_api_requests_total", "Total backend requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    /// Status fetches by outcome (applied, stale, failed, malformed, cancelled).
    pub static ref STATUS_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ptactl_status_fetches_total", "Status fetches by outcome"),
        &["outcome"],
    )
    .unwrap();

    /// User actions by operation and outcome.
    pub static ref INSTANCE_ACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ptactl_instance_actions_total", "Instance actions by outcome"),
        &["operation", "outcome"],
    )
    .unwrap();

    /// Responses dropped because a newer fetch for the same challenge was issued.
    pub static ref STALE_RESPONSES_DISCARDED_TOTAL: IntCounter = IntCounter::new(
        "ptactl_stale_responses_discarded_total",
        "Status responses discarded as stale",
    )
    .unwrap();

    /// Optimistic states reverted after a failed action.
    pub static ref OPTIMISTIC_ROLLBACKS_TOTAL: IntCounter = IntCounter::new(
        "ptactl_optimistic_rollbacks_total",
        "Optimistic states rolled back",
    )
    .unwrap();

    /// Realtime messages received, by event name.
    pub static ref REALTIME_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ptactl_realtime_events_total", "Realtime messages received"),
        &["event"],
    )
    .unwrap();

    /// Realtime reconnect attempts.
    pub static ref REALTIME_RECONNECTS_TOTAL: IntCounter = IntCounter::new(
        "ptactl_realtime_reconnects_total",
        "Realtime reconnect attempts",
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Backend request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "ptactl_api_request_duration_seconds",
            "Backend request duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_POLLERS.clone()),
        Box::new(REALTIME_CONNECTED.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(STATUS_FETCHES_TOTAL.clone()),
        Box::new(INSTANCE_ACTIONS_TOTAL.clone()),
        Box::new(STALE_RESPONSES_DISCARDED_TOTAL.clone()),
        Box::new(OPTIMISTIC_ROLLBACKS_TOTAL.clone()),
        Box::new(REALTIME_EVENTS_TOTAL.clone()),
        Box::new(REALTIME_RECONNECTS_TOTAL.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        // AlreadyReg on a second call is fine
        let _ = REGISTRY.register(c);
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// so every challenge shares one series.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
