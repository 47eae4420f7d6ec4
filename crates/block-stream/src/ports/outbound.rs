//! Outbound ports (SPI) for the block stream publisher.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::{
    BlockBufferConfig, BlockNodeConfiguration, BlockNodeConnectionConfig, HighLatencyResult,
};
use crate::events::{
    BlockNodeStatus, EndOfStreamCode, EndStreamCode, PublishStreamRequest, PublishStreamResponse,
    TransportError,
};
use crate::service::BlockNodeConnection;

// =============================================================================
// TRANSPORT
// =============================================================================

/// Factory for bidirectional publish streams to Block Nodes.
///
/// Responses for an opened stream are delivered to the given observer from
/// the transport's own context.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a publish stream to `node`.
    async fn open(
        &self,
        node: &BlockNodeConfiguration,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Arc<dyn RequestPipeline>, TransportError>;

    /// Queries the peer's control service. `Ok(None)` means the transport
    /// cannot report status; the peer is then assumed available.
    async fn query_status(
        &self,
        _node: &BlockNodeConfiguration,
    ) -> Result<Option<BlockNodeStatus>, TransportError> {
        Ok(None)
    }
}

/// Sending half of an open publish stream.
#[async_trait]
pub trait RequestPipeline: Send + Sync {
    async fn send(&self, request: PublishStreamRequest) -> Result<(), TransportError>;

    /// Half-closes the stream (no more requests will follow).
    async fn close(&self) -> Result<(), TransportError>;
}

/// Receiving half of an open publish stream.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    async fn on_next(&self, response: PublishStreamResponse);

    async fn on_error(&self, error: TransportError);

    async fn on_completed(&self);
}

// =============================================================================
// CONNECTION COORDINATION
// =============================================================================

/// Manager-side hooks a connection reports into.
pub trait ConnectionCoordinator: Send + Sync {
    /// Closed connection wants to be retried after `delay` (or backoff when
    /// `None`), optionally resuming at `resume_block`. With
    /// `select_new_node`, another peer takes over meanwhile.
    fn reschedule_connection(
        &self,
        connection: &Arc<BlockNodeConnection>,
        delay: Option<Duration>,
        resume_block: Option<u64>,
        select_new_node: bool,
    );

    /// Connection closed without asking to be retried.
    fn notify_connection_closed(&self, connection: &Arc<BlockNodeConnection>);

    /// Connection closed for a reason that retrying the same peer cannot fix.
    fn notify_connection_unrecoverable(&self, connection: &Arc<BlockNodeConnection>);

    /// Peer verified every block up to `block_number`.
    fn record_acknowledgement(&self, node: &BlockNodeConfiguration, block_number: u64);

    fn record_block_ack_and_check_latency(
        &self,
        node: &BlockNodeConfiguration,
        block_number: u64,
        at: Instant,
    ) -> HighLatencyResult;

    fn record_block_proof_sent(&self, node: &BlockNodeConfiguration, block_number: u64, at: Instant);

    /// Returns `true` if the peer exceeded its EndOfStream allowance.
    fn record_end_of_stream_and_check_limit(&self, node: &BlockNodeConfiguration, at: Instant)
        -> bool;

    fn is_only_one_block_node_configured(&self) -> bool;
}

/// Receiver of quorum-released blocks.
pub trait CleanupSink: Send + Sync {
    /// Releases `block_number`; afterwards it is no longer retained.
    fn on_block_ready_for_cleanup(&self, block_number: u64);

    /// Retained blocks at or below `block_number`, in ascending order.
    fn retained_blocks_through(&self, block_number: u64) -> Vec<u64>;
}

/// Reacts to block buffer saturation.
pub trait BufferPressureHandler: Send + Sync {
    /// The buffer reached the action stage; streaming should move to another
    /// peer.
    fn on_buffer_action_stage(&self, saturation_percent: f64);
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Source of peer and behaviour configuration.
pub trait ConfigProvider: Send + Sync {
    fn block_nodes(&self) -> Vec<BlockNodeConfiguration>;

    fn connection_config(&self) -> BlockNodeConnectionConfig;

    fn buffer_config(&self) -> BlockBufferConfig {
        BlockBufferConfig::default()
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Metrics sink. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait StreamMetrics: Send + Sync {
    // Connection lifecycle
    fn record_connection_opened(&self) {}
    fn record_connection_closed(&self) {}
    fn record_connection_on_error(&self) {}
    fn record_connection_on_complete(&self) {}
    fn record_connection_create_failure(&self) {}
    fn record_active_connection(&self, node: &BlockNodeConfiguration) {}
    fn record_no_active_connection(&self) {}

    // Requests
    fn record_request_sent(&self, kind: &'static str) {}
    fn record_block_items_sent(&self, count: usize) {}
    fn record_request_bytes(&self, bytes: usize) {}
    fn record_request_latency(&self, latency: Duration) {}
    fn record_request_send_failure(&self) {}
    fn record_end_stream_sent(&self, code: EndStreamCode) {}
    fn record_request_exceeds_hard_limit(&self) {}
    fn record_multi_item_request_exceeds_soft_limit(&self) {}
    fn record_pipeline_operation_timeout(&self) {}

    // Responses
    fn record_response_received(&self, kind: &'static str) {}
    fn record_end_of_stream_received(&self, code: EndOfStreamCode) {}
    fn record_unknown_response(&self) {}
    fn record_end_of_stream_limit_exceeded(&self) {}
    fn record_high_latency_event(&self) {}
    fn record_latest_block_acked(&self, block_number: u64) {}
    fn record_block_closed_to_ack_latency(&self, latency: Duration) {}

    // Buffer
    fn record_block_opened(&self, block_number: u64) {}
    fn record_block_closed(&self, block_number: u64) {}
    fn record_block_missing(&self, block_number: u64) {}
    fn record_blocks_cleaned(&self, count: usize) {}
    fn record_buffer_saturation(&self, percent: f64) {}
}
