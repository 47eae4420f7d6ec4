//! Prometheus metrics for the block stream publisher.
//!
//! All metrics follow the naming convention: `bs_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., requests_sent_total)
//! - **Gauge**: Value that can go up or down (e.g., buffer_saturation_percent)
//! - **Histogram**: Distribution of values (e.g., request_latency_seconds)

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const SIZE_BUCKETS: &[f64] = &[
    256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 2097152.0, 4194304.0,
    6291456.0,
];

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // CONNECTION METRICS
    // =========================================================================

    /// Publish streams opened
    pub static ref CONNECTIONS_OPENED: Counter = Counter::new(
        "bs_connections_opened_total",
        "Total publish streams opened to block nodes"
    ).expect("metric creation failed");

    /// Publish streams closed
    pub static ref CONNECTIONS_CLOSED: Counter = Counter::new(
        "bs_connections_closed_total",
        "Total publish streams closed"
    ).expect("metric creation failed");

    /// Stream lifecycle events
    pub static ref CONNECTION_EVENTS: CounterVec = CounterVec::new(
        Opts::new("bs_connection_events_total", "Publish stream lifecycle events"),
        &["event"]  // event: on_error/on_complete/create_failure
    ).expect("metric creation failed");

    /// Whether a connection is currently active (0 or 1)
    pub static ref ACTIVE_CONNECTION: Gauge = Gauge::new(
        "bs_active_connection",
        "Whether a block node connection is active"
    ).expect("metric creation failed");

    /// Activations per block node
    pub static ref ACTIVE_CONNECTION_CHANGES: CounterVec = CounterVec::new(
        Opts::new("bs_active_connection_changes_total", "Times a block node became the active connection"),
        &["node"]
    ).expect("metric creation failed");

    // =========================================================================
    // REQUEST METRICS
    // =========================================================================

    /// Requests sent by kind
    pub static ref REQUESTS_SENT: CounterVec = CounterVec::new(
        Opts::new("bs_requests_sent_total", "Publish requests sent"),
        &["kind"]  // kind: block_items/end_of_block/end_stream
    ).expect("metric creation failed");

    /// Block items sent
    pub static ref BLOCK_ITEMS_SENT: Counter = Counter::new(
        "bs_block_items_sent_total",
        "Total block items sent"
    ).expect("metric creation failed");

    /// Encoded request size
    pub static ref REQUEST_BYTES: Histogram = Histogram::with_opts(
        HistogramOpts::new("bs_request_size_bytes", "Encoded size of sent requests")
            .buckets(SIZE_BUCKETS.to_vec())
    ).expect("metric creation failed");

    /// Request send latency
    pub static ref REQUEST_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("bs_request_latency_seconds", "Time spent sending a request")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).expect("metric creation failed");

    /// Request problems by reason
    pub static ref REQUEST_FAILURES: CounterVec = CounterVec::new(
        Opts::new("bs_request_failures_total", "Request send problems"),
        &["reason"]  // reason: send_failure/hard_limit/soft_limit_split/pipeline_timeout
    ).expect("metric creation failed");

    /// EndStream messages sent by code
    pub static ref END_STREAMS_SENT: CounterVec = CounterVec::new(
        Opts::new("bs_end_streams_sent_total", "EndStream requests sent"),
        &["code"]
    ).expect("metric creation failed");

    // =========================================================================
    // RESPONSE METRICS
    // =========================================================================

    /// Responses received by kind
    pub static ref RESPONSES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("bs_responses_received_total", "Responses received from block nodes"),
        &["kind"]
    ).expect("metric creation failed");

    /// EndOfStream responses by code
    pub static ref END_OF_STREAMS_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("bs_end_of_streams_received_total", "EndOfStream responses received"),
        &["code"]
    ).expect("metric creation failed");

    /// Peers that exceeded the EndOfStream allowance
    pub static ref END_OF_STREAM_LIMIT_EXCEEDED: Counter = Counter::new(
        "bs_end_of_stream_limit_exceeded_total",
        "Times a block node exceeded the EndOfStream rate limit"
    ).expect("metric creation failed");

    /// Acknowledgements over the latency threshold
    pub static ref HIGH_LATENCY_EVENTS: Counter = Counter::new(
        "bs_high_latency_events_total",
        "Acknowledgements whose latency exceeded the threshold"
    ).expect("metric creation failed");

    /// Highest acknowledged block
    pub static ref LATEST_BLOCK_ACKED: Gauge = Gauge::new(
        "bs_latest_block_acked",
        "Highest block acknowledged by any block node"
    ).expect("metric creation failed");

    /// Block close to acknowledgement latency
    pub static ref BLOCK_ACK_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("bs_block_ack_latency_seconds", "Time from block close to acknowledgement")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).expect("metric creation failed");

    // =========================================================================
    // BUFFER METRICS
    // =========================================================================

    /// Buffer events
    pub static ref BUFFER_BLOCKS: CounterVec = CounterVec::new(
        Opts::new("bs_buffer_blocks_total", "Block buffer events"),
        &["event"]  // event: opened/closed/missing/cleaned
    ).expect("metric creation failed");

    /// Latest opened block
    pub static ref LATEST_BLOCK_OPENED: Gauge = Gauge::new(
        "bs_latest_block_opened",
        "Most recently opened block"
    ).expect("metric creation failed");

    /// Buffer saturation
    pub static ref BUFFER_SATURATION: GaugeVec = GaugeVec::new(
        Opts::new("bs_buffer_saturation_percent", "Buffered blocks as a share of capacity"),
        &["buffer"]
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Calling this more than once is harmless.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Connections
        Box::new(CONNECTIONS_OPENED.clone()),
        Box::new(CONNECTIONS_CLOSED.clone()),
        Box::new(CONNECTION_EVENTS.clone()),
        Box::new(ACTIVE_CONNECTION.clone()),
        Box::new(ACTIVE_CONNECTION_CHANGES.clone()),
        // Requests
        Box::new(REQUESTS_SENT.clone()),
        Box::new(BLOCK_ITEMS_SENT.clone()),
        Box::new(REQUEST_BYTES.clone()),
        Box::new(REQUEST_LATENCY.clone()),
        Box::new(REQUEST_FAILURES.clone()),
        Box::new(END_STREAMS_SENT.clone()),
        // Responses
        Box::new(RESPONSES_RECEIVED.clone()),
        Box::new(END_OF_STREAMS_RECEIVED.clone()),
        Box::new(END_OF_STREAM_LIMIT_EXCEEDED.clone()),
        Box::new(HIGH_LATENCY_EVENTS.clone()),
        Box::new(LATEST_BLOCK_ACKED.clone()),
        Box::new(BLOCK_ACK_LATENCY.clone()),
        // Buffer
        Box::new(BUFFER_BLOCKS.clone()),
        Box::new(LATEST_BLOCK_OPENED.clone()),
        Box::new(BUFFER_SATURATION.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
