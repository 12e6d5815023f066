use std::sync::Once;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Fetch metrics
    pub static ref FETCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("ingest_fetches_total", "Completed fetches by source and outcome"),
        &["source", "outcome"]
    ).unwrap();

    pub static ref FETCH_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("ingest_fetch_retries_total", "Retry attempts after transient failures"),
        &["source"]
    ).unwrap();

    pub static ref CIRCUIT_BREAKER_TRIPS: IntCounterVec = IntCounterVec::new(
        Opts::new("ingest_circuit_breaker_trips_total", "Transitions into the open state"),
        &["source"]
    ).unwrap();

    // Connection metrics
    pub static ref ACTIVE_CONNECTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ingest_active_connections", "Outstanding HTTP requests per source"),
        &["source"]
    ).unwrap();

    // Buffer metrics
    pub static ref BUFFER_DEPTH: IntGauge = IntGauge::new(
        "ingest_buffer_depth",
        "Items waiting in the result buffer"
    ).unwrap();

    pub static ref BUFFER_DROPPED: IntCounter = IntCounter::new(
        "ingest_buffer_dropped_total",
        "Items dropped because the result buffer was full"
    ).unwrap();

    // Latency metrics
    pub static ref FETCH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "ingest_fetch_latency_seconds",
            "Wall-clock latency of engine fetches"
        ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["source"]
    ).unwrap();
}

static REGISTER: Once = Once::new();

/// Registers all collectors with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(FETCHES.clone())).unwrap();
        REGISTRY.register(Box::new(FETCH_RETRIES.clone())).unwrap();
        REGISTRY.register(Box::new(CIRCUIT_BREAKER_TRIPS.clone())).unwrap();
        REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone())).unwrap();
        REGISTRY.register(Box::new(BUFFER_DEPTH.clone())).unwrap();
        REGISTRY.register(Box::new(BUFFER_DROPPED.clone())).unwrap();
        REGISTRY.register(Box::new(FETCH_LATENCY.clone())).unwrap();
    });
}

/// Prometheus text exposition of [`REGISTRY`].
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        register_metrics();
        register_metrics();
        FETCHES.with_label_values(&["registry_test", "success"]).inc();
        assert!(gather_text().contains("ingest_fetches_total"));
    }
}
