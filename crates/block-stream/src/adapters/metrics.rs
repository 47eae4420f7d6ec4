//! Metrics adapters.
//!
//! `PrometheusStreamMetrics` records into the `stream-telemetry` registry;
//! `NoopStreamMetrics` discards everything.

use std::time::Duration;

use stream_telemetry::metrics::{
    ACTIVE_CONNECTION, ACTIVE_CONNECTION_CHANGES, BLOCK_ACK_LATENCY, BLOCK_ITEMS_SENT,
    BUFFER_BLOCKS, BUFFER_SATURATION, CONNECTIONS_CLOSED, CONNECTIONS_OPENED, CONNECTION_EVENTS,
    END_OF_STREAMS_RECEIVED, END_OF_STREAM_LIMIT_EXCEEDED, END_STREAMS_SENT, HIGH_LATENCY_EVENTS,
    LATEST_BLOCK_ACKED, LATEST_BLOCK_OPENED, REQUESTS_SENT, REQUEST_BYTES, REQUEST_FAILURES,
    REQUEST_LATENCY, RESPONSES_RECEIVED,
};

use crate::domain::BlockNodeConfiguration;
use crate::events::{EndOfStreamCode, EndStreamCode};
use crate::ports::outbound::StreamMetrics;

/// Discards every measurement.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStreamMetrics;

impl StreamMetrics for NoopStreamMetrics {}

/// Records into the global Prometheus registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusStreamMetrics;

impl PrometheusStreamMetrics {
    pub fn new() -> Self {
        Self
    }
}

impl StreamMetrics for PrometheusStreamMetrics {
    fn record_connection_opened(&self) {
        CONNECTIONS_OPENED.inc();
    }

    fn record_connection_closed(&self) {
        CONNECTIONS_CLOSED.inc();
    }

    fn record_connection_on_error(&self) {
        CONNECTION_EVENTS.with_label_values(&["on_error"]).inc();
    }

    fn record_connection_on_complete(&self) {
        CONNECTION_EVENTS.with_label_values(&["on_complete"]).inc();
    }

    fn record_connection_create_failure(&self) {
        CONNECTION_EVENTS.with_label_values(&["create_failure"]).inc();
    }

    fn record_active_connection(&self, node: &BlockNodeConfiguration) {
        ACTIVE_CONNECTION.set(1.0);
        ACTIVE_CONNECTION_CHANGES
            .with_label_values(&[&node.node_id()])
            .inc();
    }

    fn record_no_active_connection(&self) {
        ACTIVE_CONNECTION.set(0.0);
    }

    fn record_request_sent(&self, kind: &'static str) {
        REQUESTS_SENT.with_label_values(&[kind]).inc();
    }

    fn record_block_items_sent(&self, count: usize) {
        BLOCK_ITEMS_SENT.inc_by(count as f64);
    }

    fn record_request_bytes(&self, bytes: usize) {
        REQUEST_BYTES.observe(bytes as f64);
    }

    fn record_request_latency(&self, latency: Duration) {
        REQUEST_LATENCY.observe(latency.as_secs_f64());
    }

    fn record_request_send_failure(&self) {
        REQUEST_FAILURES.with_label_values(&["send_failure"]).inc();
    }

    fn record_end_stream_sent(&self, code: EndStreamCode) {
        END_STREAMS_SENT.with_label_values(&[code.as_str()]).inc();
    }

    fn record_request_exceeds_hard_limit(&self) {
        REQUEST_FAILURES.with_label_values(&["hard_limit"]).inc();
    }

    fn record_multi_item_request_exceeds_soft_limit(&self) {
        REQUEST_FAILURES
            .with_label_values(&["soft_limit_split"])
            .inc();
    }

    fn record_pipeline_operation_timeout(&self) {
        REQUEST_FAILURES
            .with_label_values(&["pipeline_timeout"])
            .inc();
    }

    fn record_response_received(&self, kind: &'static str) {
        RESPONSES_RECEIVED.with_label_values(&[kind]).inc();
    }

    fn record_end_of_stream_received(&self, code: EndOfStreamCode) {
        END_OF_STREAMS_RECEIVED
            .with_label_values(&[code.as_str()])
            .inc();
    }

    fn record_unknown_response(&self) {
        RESPONSES_RECEIVED.with_label_values(&["unknown"]).inc();
    }

    fn record_end_of_stream_limit_exceeded(&self) {
        END_OF_STREAM_LIMIT_EXCEEDED.inc();
    }

    fn record_high_latency_event(&self) {
        HIGH_LATENCY_EVENTS.inc();
    }

    fn record_latest_block_acked(&self, block_number: u64) {
        LATEST_BLOCK_ACKED.set(block_number as f64);
    }

    fn record_block_closed_to_ack_latency(&self, latency: Duration) {
        BLOCK_ACK_LATENCY.observe(latency.as_secs_f64());
    }

    fn record_block_opened(&self, block_number: u64) {
        BUFFER_BLOCKS.with_label_values(&["opened"]).inc();
        LATEST_BLOCK_OPENED.set(block_number as f64);
    }

    fn record_block_closed(&self, _block_number: u64) {
        BUFFER_BLOCKS.with_label_values(&["closed"]).inc();
    }

    fn record_block_missing(&self, _block_number: u64) {
        BUFFER_BLOCKS.with_label_values(&["missing"]).inc();
    }

    fn record_blocks_cleaned(&self, count: usize) {
        BUFFER_BLOCKS
            .with_label_values(&["cleaned"])
            .inc_by(count as f64);
    }

    fn record_buffer_saturation(&self, percent: f64) {
        BUFFER_SATURATION
            .with_label_values(&["block"])
            .set(percent);
    }
}
