use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbound event metrics
    pub static ref EVENTS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("load_events_received_total", "Completed-load events received by resource type"),
        &["resource_type"]
    ).unwrap();

    pub static ref EVENTS_IGNORED: IntCounter = IntCounter::new(
        "load_events_ignored_total",
        "Completed-load events ignored (non-image resource type)"
    ).unwrap();

    // Pipeline metrics
    pub static ref CLASSIFICATIONS: IntCounter = IntCounter::new(
        "classifications_total",
        "Total number of completed image classifications"
    ).unwrap();

    pub static ref FETCH_FAILURES: IntCounter = IntCounter::new(
        "image_fetch_failures_total",
        "Total number of images that could not be fetched or decoded"
    ).unwrap();

    pub static ref INFERENCE_FAILURES: IntCounter = IntCounter::new(
        "inference_failures_total",
        "Total number of failed model invocations"
    ).unwrap();

    pub static ref DUPLICATES_SKIPPED: IntCounter = IntCounter::new(
        "duplicate_inflight_skipped_total",
        "Events skipped because the same URL was already being classified"
    ).unwrap();

    pub static ref CANCELLATIONS: IntCounter = IntCounter::new(
        "classifications_cancelled_total",
        "In-flight classifications cancelled because the owning tab closed"
    ).unwrap();

    pub static ref NOTIFICATIONS_SENT: IntCounter = IntCounter::new(
        "notifications_sent_total",
        "Total number of IMAGE_PROCESSED notifications sent"
    ).unwrap();

    pub static ref TRACKED_IMAGES: IntGauge = IntGauge::new(
        "tracked_images",
        "Number of image URLs held by the request tracker"
    ).unwrap();

    // Model metrics
    pub static ref MODEL_READY: IntGauge = IntGauge::new(
        "model_ready",
        "1 once the classification model is loaded and warmed up"
    ).unwrap();

    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("inference_latency_seconds", "Model inference latency in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(EVENTS_RECEIVED.clone())).unwrap();
    REGISTRY.register(Box::new(EVENTS_IGNORED.clone())).unwrap();

    REGISTRY.register(Box::new(CLASSIFICATIONS.clone())).unwrap();
    REGISTRY.register(Box::new(FETCH_FAILURES.clone())).unwrap();
    REGISTRY.register(Box::new(INFERENCE_FAILURES.clone())).unwrap();
    REGISTRY.register(Box::new(DUPLICATES_SKIPPED.clone())).unwrap();
    REGISTRY.register(Box::new(CANCELLATIONS.clone())).unwrap();
    REGISTRY.register(Box::new(NOTIFICATIONS_SENT.clone())).unwrap();
    REGISTRY.register(Box::new(TRACKED_IMAGES.clone())).unwrap();

    REGISTRY.register(Box::new(MODEL_READY.clone())).unwrap();
    REGISTRY.register(Box::new(INFERENCE_LATENCY.clone())).unwrap();

    tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
