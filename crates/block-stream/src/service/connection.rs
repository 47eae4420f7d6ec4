//! # Block Node Connection
//!
//! One bidirectional publish stream to one Block Node.
//!
//! The connection owns its lifecycle state (see [`crate::domain::transition`]),
//! the position of the block it is streaming, and a worker task that drains
//! the block buffer into size-bounded requests while the connection is
//! `ACTIVE`. Responses from the peer arrive through [`StreamObserver`].
//!
//! Failure handling never reaches outside the connection except through the
//! [`ConnectionCoordinator`]: the connection closes itself and asks the
//! manager to reschedule, fail over, or give up on the peer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::domain::{
    check_request_size, invariant_streaming_progress, place_item, transition,
    BlockNodeConfiguration, BlockNodeConnectionConfig, BlockState, ConnectionEffect,
    ConnectionState, ItemPlacement, PendingRequest, RequestBudget, SizeCheck,
};
use crate::events::{
    BlockStreamError, EndOfStreamCode, EndStreamCode, PipelineOperation, PublishStreamRequest,
    PublishStreamResponse, TransportError, NO_VERIFIED_BLOCK,
};
use crate::ports::inbound::BlockBufferApi;
use crate::ports::outbound::{
    ConnectionCoordinator, RequestPipeline, StreamMetrics, StreamObserver, StreamTransport,
};
use crate::service::{BlockBufferService, PipelineTaskRunner};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared collaborators handed to every connection of a manager.
#[derive(Clone)]
pub struct ConnectionContext {
    pub buffer: Arc<BlockBufferService>,
    pub transport: Arc<dyn StreamTransport>,
    pub coordinator: Weak<dyn ConnectionCoordinator>,
    pub metrics: Arc<dyn StreamMetrics>,
    pub runner: PipelineTaskRunner,
}

/// Block being streamed plus a counter of externally requested jumps.
///
/// The worker advances `block` itself after an end-of-block; every other
/// change (skip, resend, jump) bumps `epoch` so the worker restarts the block
/// from its first item even when the number did not change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct StreamPosition {
    block: Option<u64>,
    epoch: u64,
}

struct WorkerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// A publish stream to one Block Node.
pub struct BlockNodeConnection {
    id: u64,
    node: BlockNodeConfiguration,
    config: BlockNodeConnectionConfig,
    budget: RequestBudget,
    state: AtomicU8,
    position: Mutex<StreamPosition>,
    close_at_block_boundary: AtomicBool,
    stream_shutdown_in_progress: AtomicBool,
    requests_sent: AtomicU64,
    pipeline: Mutex<Option<Arc<dyn RequestPipeline>>>,
    worker: Mutex<Option<WorkerHandle>>,
    reset_timer: Mutex<Option<CancellationToken>>,
    context: ConnectionContext,
    self_ref: Weak<BlockNodeConnection>,
}

impl BlockNodeConnection {
    pub fn new(
        node: BlockNodeConfiguration,
        config: BlockNodeConnectionConfig,
        context: ConnectionContext,
    ) -> Arc<Self> {
        let budget = RequestBudget::for_node(
            &node,
            config.request_padding_bytes,
            config.item_padding_bytes,
        );
        Arc::new_cyclic(|self_ref| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            node,
            config,
            budget,
            state: AtomicU8::new(ConnectionState::Uninitialized.as_u8()),
            position: Mutex::new(StreamPosition::default()),
            close_at_block_boundary: AtomicBool::new(false),
            stream_shutdown_in_progress: AtomicBool::new(false),
            requests_sent: AtomicU64::new(0),
            pipeline: Mutex::new(None),
            worker: Mutex::new(None),
            reset_timer: Mutex::new(None),
            context,
            self_ref: self_ref.clone(),
        })
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn configuration(&self) -> &BlockNodeConfiguration {
        &self.node
    }

    pub fn priority(&self) -> u32 {
        self.node.priority
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Block the worker sends next, once streaming has started.
    pub fn streaming_block_number(&self) -> Option<u64> {
        self.position.lock().block
    }

    pub fn is_closing_at_block_boundary(&self) -> bool {
        self.close_at_block_boundary.load(Ordering::Acquire)
    }

    /// Asks the worker to close once the current block is complete.
    pub fn close_at_block_boundary(&self) {
        if !self.close_at_block_boundary.swap(true, Ordering::AcqRel) {
            info!(connection = %self, "Connection will close at the next block boundary");
        }
    }

    /// Moves streaming to `block_number`, forwards or backwards.
    pub fn jump_to_block(&self, block_number: u64) {
        let mut position = self.position.lock();
        let previous = position.block;
        position.block = Some(block_number);
        position.epoch += 1;
        drop(position);
        info!(connection = %self, ?previous, block_number, "Streaming position moved");
    }

    fn stream_position(&self) -> StreamPosition {
        *self.position.lock()
    }

    /// Sets the first block to stream unless one is already set.
    fn start_streaming_at(&self, block_number: u64) -> bool {
        let mut position = self.position.lock();
        if position.block.is_some() {
            return false;
        }
        position.block = Some(block_number);
        true
    }

    /// Worker-side move from `from` to `to`; fails if someone moved first.
    fn advance_streaming(&self, from: u64, to: u64) -> bool {
        let mut position = self.position.lock();
        if position.block != Some(from) {
            return false;
        }
        debug_assert!(invariant_streaming_progress(position.block, Some(to), false));
        position.block = Some(to);
        true
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Opens the publish stream and moves the connection to `READY`.
    pub async fn initialize(&self) -> Result<(), BlockStreamError> {
        let observer: Arc<dyn StreamObserver> = self
            .self_ref
            .upgrade()
            .ok_or(BlockStreamError::PipelineUnavailable)?;

        let opened = self
            .context
            .runner
            .run_with_timeout(
                PipelineOperation::Open,
                self.config.connection_timeout,
                self.context.transport.open(&self.node, observer),
            )
            .await;
        let pipeline = match opened {
            Ok(pipeline) => pipeline,
            Err(error) => {
                if error.is_timeout() {
                    self.context.metrics.record_pipeline_operation_timeout();
                }
                self.context.metrics.record_connection_create_failure();
                warn!(connection = %self, %error, "Failed to open publish stream");
                return Err(error);
            }
        };

        *self.pipeline.lock() = Some(pipeline);
        if let Err(error) = self.update_connection_state(ConnectionState::Ready) {
            // Closed while the stream was opening.
            let pipeline = self.pipeline.lock().take();
            if let Some(pipeline) = pipeline {
                let _ = self
                    .context
                    .runner
                    .run(PipelineOperation::Close, pipeline.close())
                    .await;
            }
            return Err(error);
        }

        self.context.metrics.record_connection_opened();
        info!(connection = %self, "Publish stream opened");
        Ok(())
    }

    /// Moves to `target`, applying the transition's effects.
    ///
    /// Returns the state the connection was in before the move.
    pub fn update_connection_state(
        &self,
        target: ConnectionState,
    ) -> Result<ConnectionState, BlockStreamError> {
        loop {
            let current = self.state();
            if self.compare_and_set_state(current, target)? {
                return Ok(current);
            }
        }
    }

    fn compare_and_set_state(
        &self,
        expected: ConnectionState,
        target: ConnectionState,
    ) -> Result<bool, BlockStreamError> {
        let transition = transition(expected, target).map_err(|error| {
            error!(connection = %self, %error, "Rejected connection state change");
            error
        })?;
        if transition.is_noop() {
            return Ok(self.state() == expected);
        }
        if self
            .state
            .compare_exchange(
                expected.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }

        debug!(connection = %self, from = ?expected, to = ?target, "Connection state changed");
        for effect in &transition.effects {
            self.apply_effect(*effect);
        }
        Ok(true)
    }

    fn apply_effect(&self, effect: ConnectionEffect) {
        match effect {
            ConnectionEffect::StartWorker => self.start_worker(),
            ConnectionEffect::StopWorker => {
                if let Some(worker) = self.worker.lock().take() {
                    worker.token.cancel();
                    trace!(connection = %self, finished = worker.task.is_finished(), "Stopping worker");
                }
            }
            ConnectionEffect::ScheduleStreamReset => self.schedule_stream_reset(),
            ConnectionEffect::CancelStreamReset => {
                if let Some(timer) = self.reset_timer.lock().take() {
                    timer.cancel();
                }
            }
        }
    }

    fn start_worker(&self) {
        let Some(connection) = self.self_ref.upgrade() else {
            return;
        };
        let token = self.context.runner.shutdown_token().child_token();
        let worker = ConnectionWorker::new(connection, token.clone());
        let task = tokio::spawn(worker.run());
        if let Some(previous) = self.worker.lock().replace(WorkerHandle { token, task }) {
            previous.token.cancel();
        }
    }

    fn schedule_stream_reset(&self) {
        let period = self.config.stream_reset_period;
        if period.is_zero() {
            return;
        }
        let token = self.context.runner.shutdown_token().child_token();
        if let Some(previous) = self.reset_timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let connection = self.self_ref.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(connection) = connection.upgrade() else { break };
                        connection.reset_stream().await;
                    }
                }
            }
        });
    }

    /// Closes the connection and tells the manager. Returns `false` if the
    /// connection was already closing or closed.
    pub async fn close(&self, call_on_complete: bool) -> bool {
        let closed = self.close_internal(call_on_complete).await;
        if closed {
            self.with_coordinator(|coordinator, connection| {
                coordinator.notify_connection_closed(connection)
            });
        }
        closed
    }

    async fn close_internal(&self, call_on_complete: bool) -> bool {
        loop {
            let current = self.state();
            if current.is_terminal() {
                debug!(connection = %self, state = ?current, "Connection already closing");
                return false;
            }
            match self.compare_and_set_state(current, ConnectionState::Closing) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(_) => return false,
            }
        }

        info!(connection = %self, call_on_complete, "Closing connection");
        let pipeline = self.pipeline.lock().take();
        if let (Some(pipeline), true) = (pipeline, call_on_complete) {
            self.stream_shutdown_in_progress.store(true, Ordering::Release);
            if let Err(error) = self
                .context
                .runner
                .run(PipelineOperation::Close, pipeline.close())
                .await
            {
                if error.is_timeout() {
                    self.context.metrics.record_pipeline_operation_timeout();
                }
                warn!(connection = %self, %error, "Failed to close publish stream cleanly");
            }
        }

        self.context.metrics.record_connection_closed();
        let _ = self.update_connection_state(ConnectionState::Closed);
        info!(connection = %self, "Connection closed");
        true
    }

    fn with_coordinator<R>(
        &self,
        f: impl FnOnce(&dyn ConnectionCoordinator, &Arc<BlockNodeConnection>) -> R,
    ) -> Option<R> {
        let coordinator = self.context.coordinator.upgrade()?;
        let connection = self.self_ref.upgrade()?;
        Some(f(coordinator.as_ref(), &connection))
    }

    fn reschedule(&self, delay: Option<Duration>, resume_block: Option<u64>, select_new_node: bool) {
        self.with_coordinator(|coordinator, connection| {
            coordinator.reschedule_connection(connection, delay, resume_block, select_new_node)
        });
    }

    fn is_only_one_block_node_configured(&self) -> bool {
        self.with_coordinator(|coordinator, _| coordinator.is_only_one_block_node_configured())
            .unwrap_or(true)
    }

    // =========================================================================
    // FAILURE FLOWS
    // =========================================================================

    async fn close_and_reschedule(&self, delay: Duration, call_on_complete: bool) {
        if self.close_internal(call_on_complete).await {
            self.reschedule(Some(delay), None, true);
        }
    }

    /// Closes and reconnects to the same peer starting at `block_number`.
    async fn close_and_restart(&self, block_number: u64) {
        if self.close_internal(true).await {
            self.reschedule(None, Some(block_number), false);
        }
    }

    /// Sends `EndStream(code)` if still active, then closes. Returns `true`
    /// if this call closed the connection.
    async fn end_the_stream(&self, code: EndStreamCode) -> bool {
        if self.state() == ConnectionState::Active {
            let buffer = &self.context.buffer;
            let request = PublishStreamRequest::EndStream {
                code,
                earliest_block_number: buffer.earliest_available_block_number(),
                latest_block_number: buffer.highest_acked_block_number(),
            };
            info!(connection = %self, code = code.as_str(), "Ending stream");
            if self.send_request(request).await.is_ok() {
                self.context.metrics.record_end_stream_sent(code);
            }
        }
        self.close_internal(true).await
    }

    async fn end_stream_and_reschedule(&self, code: EndStreamCode) {
        if self.end_the_stream(code).await {
            self.reschedule(Some(self.config.failure_reschedule_delay), None, true);
        }
    }

    async fn end_stream_unrecoverable(&self, code: EndStreamCode) {
        if self.end_the_stream(code).await {
            self.with_coordinator(|coordinator, connection| {
                coordinator.notify_connection_unrecoverable(connection)
            });
        }
    }

    async fn close_now_at_block_boundary(&self) {
        if self.end_the_stream(EndStreamCode::Reset).await {
            self.with_coordinator(|coordinator, connection| {
                coordinator.notify_connection_closed(connection)
            });
        }
    }

    /// Periodic reset: end the stream and reconnect at once.
    async fn reset_stream(&self) {
        if self.state() != ConnectionState::Active {
            return;
        }
        info!(connection = %self, "Performing periodic stream reset");
        let resume_block = self.streaming_block_number();
        if self.end_the_stream(EndStreamCode::Reset).await {
            self.reschedule(Some(Duration::ZERO), resume_block, true);
        }
    }

    pub async fn handle_stream_failure(&self) {
        info!(connection = %self, "Handling stream failure");
        self.close_and_reschedule(self.config.failure_reschedule_delay, true)
            .await;
    }

    async fn handle_stream_failure_without_on_complete(&self) {
        info!(connection = %self, "Handling stream failure without completing the stream");
        self.close_and_reschedule(self.config.failure_reschedule_delay, false)
            .await;
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Sends one request under the pipeline timeout. Only allowed while
    /// `ACTIVE`; a failed send closes and reschedules the connection.
    pub async fn send_request(&self, request: PublishStreamRequest) -> Result<(), BlockStreamError> {
        let state = self.state();
        if state != ConnectionState::Active {
            return Err(BlockStreamError::NotActive(state));
        }
        let pipeline = self
            .pipeline
            .lock()
            .clone()
            .ok_or(BlockStreamError::PipelineUnavailable)?;

        let kind = request.kind();
        let bytes = request.encoded_len();
        let items = request.item_count();
        let started = Instant::now();

        match self
            .context
            .runner
            .run(PipelineOperation::Send, pipeline.send(request))
            .await
        {
            Ok(()) => {
                let sequence = self.requests_sent.fetch_add(1, Ordering::Relaxed) + 1;
                let metrics = &self.context.metrics;
                metrics.record_request_sent(kind);
                metrics.record_request_bytes(bytes);
                if items > 0 {
                    metrics.record_block_items_sent(items);
                }
                metrics.record_request_latency(started.elapsed());
                trace!(connection = %self, sequence, kind, bytes, items, "Request sent");
                Ok(())
            }
            Err(error) => {
                if error.is_timeout() {
                    self.context.metrics.record_pipeline_operation_timeout();
                }
                self.context.metrics.record_request_send_failure();
                warn!(connection = %self, kind, %error, "Failed to send request");
                if !matches!(error, BlockStreamError::Cancelled) {
                    self.handle_stream_failure_without_on_complete().await;
                }
                Err(error)
            }
        }
    }

    // =========================================================================
    // RESPONSES
    // =========================================================================

    async fn handle_acknowledgement(&self, block_number: u64) {
        self.acknowledge_blocks(block_number, true);

        let result = self
            .with_coordinator(|coordinator, _| {
                coordinator.record_block_ack_and_check_latency(&self.node, block_number, Instant::now())
            })
            .unwrap_or_default();
        if result.should_switch && !self.is_only_one_block_node_configured() {
            warn!(
                connection = %self,
                block_number,
                latency = ?result.latency,
                consecutive = result.consecutive_high_latency_events,
                "Acknowledgement latency too high, switching block node"
            );
            self.end_stream_and_reschedule(EndStreamCode::Timeout).await;
        }
    }

    /// Records that the peer verified every block up to `block_number`.
    ///
    /// With `maybe_jump`, streaming skips ahead when the peer is ahead of
    /// this connection or of the producer.
    fn acknowledge_blocks(&self, block_number: u64, maybe_jump: bool) {
        let buffer = &self.context.buffer;
        if let Some(closed_at) = buffer
            .get_block_state(block_number)
            .and_then(|block| block.closed_at())
        {
            self.context
                .metrics
                .record_block_closed_to_ack_latency(closed_at.elapsed());
        }

        buffer.set_latest_acknowledged_block(block_number);
        self.with_coordinator(|coordinator, _| {
            coordinator.record_acknowledgement(&self.node, block_number)
        });
        debug!(connection = %self, block_number, "Block acknowledged");

        if !maybe_jump {
            return;
        }
        let last_produced = buffer.last_block_number_produced();
        let mut position = self.position.lock();
        let ahead_of_producer = last_produced.is_some_and(|last| block_number > last);
        let ahead_of_stream = position.block.is_some_and(|streaming| block_number > streaming);
        if !(ahead_of_producer || ahead_of_stream) {
            return;
        }
        let target = block_number.saturating_add(1);
        let next = position.block.map_or(target, |streaming| streaming.max(target));
        if position.block != Some(next) {
            let previous = position.block;
            position.block = Some(next);
            position.epoch += 1;
            drop(position);
            info!(
                connection = %self,
                acknowledged = block_number,
                ?previous,
                next,
                "Peer is ahead, moving streaming position"
            );
        }
    }

    fn handle_skip_block(&self, block_number: u64) {
        let mut position = self.position.lock();
        if position.block == Some(block_number) {
            position.block = Some(block_number.saturating_add(1));
            position.epoch += 1;
            drop(position);
            debug!(connection = %self, block_number, "Peer has the block, skipping it");
        } else {
            debug!(
                connection = %self,
                block_number,
                streaming = ?position.block,
                "Ignoring skip for a block that is not being streamed"
            );
        }
    }

    async fn handle_resend_block(&self, block_number: u64) {
        if self.context.buffer.get_block_state(block_number).is_some() {
            info!(connection = %self, block_number, "Peer requested a resend");
            self.jump_to_block(block_number);
        } else {
            self.handle_unavailable_block(block_number).await;
        }
    }

    async fn handle_node_behind(&self, last_verified: u64) {
        let wanted = if last_verified == NO_VERIFIED_BLOCK {
            0
        } else {
            last_verified.saturating_add(1)
        };
        if self.context.buffer.get_block_state(wanted).is_some() {
            info!(connection = %self, wanted, "Peer is behind, rewinding");
            self.jump_to_block(wanted);
        } else {
            self.handle_unavailable_block(wanted).await;
        }
    }

    /// A block the peer asked for is not buffered. Released blocks end the
    /// stream with `TOO_FAR_BEHIND`, blocks never produced with `ERROR`. A
    /// gap inside the buffered range leaves the stream untouched.
    async fn handle_unavailable_block(&self, block_number: u64) {
        let buffer = &self.context.buffer;
        let earliest = buffer.earliest_available_block_number();
        let last_produced = buffer.last_block_number_produced();
        if earliest.is_some_and(|earliest| block_number < earliest) {
            warn!(
                connection = %self,
                block_number,
                ?earliest,
                "Requested block was already released, peer is too far behind"
            );
            self.end_stream_and_reschedule(EndStreamCode::TooFarBehind)
                .await;
        } else if last_produced.map_or(true, |last| block_number > last) {
            warn!(
                connection = %self,
                block_number,
                ?last_produced,
                "Requested block was never produced"
            );
            self.end_stream_and_reschedule(EndStreamCode::Error).await;
        } else {
            warn!(
                connection = %self,
                block_number,
                ?earliest,
                ?last_produced,
                "Requested block is missing from the buffered range, ignoring"
            );
        }
    }

    async fn handle_end_of_stream(&self, code: EndOfStreamCode, last_verified: u64) {
        self.context.metrics.record_end_of_stream_received(code);
        warn!(
            connection = %self,
            code = code.as_str(),
            last_verified,
            "Peer ended the stream"
        );
        if last_verified != NO_VERIFIED_BLOCK {
            self.acknowledge_blocks(last_verified, false);
        }

        let limit_exceeded = self
            .with_coordinator(|coordinator, _| {
                coordinator.record_end_of_stream_and_check_limit(&self.node, Instant::now())
            })
            .unwrap_or(false);
        if limit_exceeded {
            warn!(
                connection = %self,
                delay = ?self.config.end_of_stream_schedule_delay,
                "Too many EndOfStream responses, backing off"
            );
            self.context.metrics.record_end_of_stream_limit_exceeded();
            self.close_and_reschedule(self.config.end_of_stream_schedule_delay, true)
                .await;
            return;
        }

        let restart_block = if last_verified == NO_VERIFIED_BLOCK {
            0
        } else {
            last_verified.saturating_add(1)
        };
        match code {
            EndOfStreamCode::Error
            | EndOfStreamCode::PersistenceFailed
            | EndOfStreamCode::Success
            | EndOfStreamCode::Unknown => {
                self.close_and_reschedule(self.config.failure_reschedule_delay, true)
                    .await;
            }
            EndOfStreamCode::Timeout
            | EndOfStreamCode::DuplicateBlock
            | EndOfStreamCode::BadBlockProof
            | EndOfStreamCode::InvalidRequest => {
                self.close_and_restart(restart_block).await;
            }
            EndOfStreamCode::Behind => {
                if self.context.buffer.get_block_state(restart_block).is_some() {
                    self.close_and_restart(restart_block).await;
                } else {
                    info!(
                        connection = %self,
                        restart_block,
                        "Peer is behind and the block was released"
                    );
                    self.end_stream_and_reschedule(EndStreamCode::TooFarBehind)
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl StreamObserver for BlockNodeConnection {
    async fn on_next(&self, response: PublishStreamResponse) {
        if self.state().is_terminal() {
            debug!(connection = %self, kind = response.kind(), "Ignoring response on closed connection");
            return;
        }
        self.context.metrics.record_response_received(response.kind());

        match response {
            PublishStreamResponse::Acknowledgement { block_number } => {
                self.handle_acknowledgement(block_number).await
            }
            PublishStreamResponse::SkipBlock { block_number } => self.handle_skip_block(block_number),
            PublishStreamResponse::ResendBlock { block_number } => {
                self.handle_resend_block(block_number).await
            }
            PublishStreamResponse::NodeBehindPublisher { block_number } => {
                self.handle_node_behind(block_number).await
            }
            PublishStreamResponse::EndOfStream {
                code,
                last_verified_block_number,
            } => {
                self.handle_end_of_stream(code, last_verified_block_number)
                    .await
            }
            PublishStreamResponse::Unset => {
                self.context.metrics.record_unknown_response();
                debug!(connection = %self, "Ignoring response without a body");
            }
        }
    }

    async fn on_error(&self, error: TransportError) {
        self.context.metrics.record_connection_on_error();
        if self.state().is_terminal() {
            debug!(connection = %self, %error, "Stream error after close");
            return;
        }
        warn!(connection = %self, %error, "Publish stream failed");
        self.handle_stream_failure().await;
    }

    async fn on_completed(&self) {
        self.context.metrics.record_connection_on_complete();
        if self.state() == ConnectionState::Closed {
            debug!(connection = %self, "Stream completed after close");
            return;
        }
        if self.stream_shutdown_in_progress.swap(false, Ordering::AcqRel) {
            debug!(connection = %self, "Stream completed after local shutdown");
            return;
        }
        warn!(connection = %self, "Peer completed the stream unexpectedly");
        self.handle_stream_failure().await;
    }
}

impl fmt::Display for BlockNodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conn#{} {}:{} {:?}",
            self.id,
            self.node.address,
            self.node.streaming_port,
            self.state()
        )
    }
}

impl fmt::Debug for BlockNodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockNodeConnection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("state", &self.state())
            .field("streaming_block", &self.streaming_block_number())
            .finish()
    }
}

// =============================================================================
// WORKER
// =============================================================================

enum Step {
    Progressed,
    Idle,
    Stop,
}

/// Drains the block buffer into requests while the connection is `ACTIVE`.
struct ConnectionWorker {
    connection: Arc<BlockNodeConnection>,
    token: CancellationToken,
    synced: Option<StreamPosition>,
    block: Option<Arc<BlockState>>,
    item_index: usize,
    pending: PendingRequest,
    last_send: Instant,
    sent: bool,
}

impl ConnectionWorker {
    fn new(connection: Arc<BlockNodeConnection>, token: CancellationToken) -> Self {
        let pending = PendingRequest::new(0, &connection.budget);
        Self {
            connection,
            token,
            synced: None,
            block: None,
            item_index: 0,
            pending,
            last_send: Instant::now(),
            sent: false,
        }
    }

    fn should_run(&self) -> bool {
        !self.token.is_cancelled() && self.connection.state() == ConnectionState::Active
    }

    async fn run(mut self) {
        debug!(connection = %self.connection, "Connection worker started");
        while self.should_run() {
            match self.step().await {
                Step::Progressed => tokio::task::yield_now().await,
                Step::Idle => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.connection.config.worker_loop_sleep) => {}
                    }
                }
                Step::Stop => break,
            }
        }
        debug!(connection = %self.connection, "Connection worker stopped");
    }

    async fn step(&mut self) -> Step {
        self.sent = false;
        let Some(position) = self.resolve_position() else {
            return Step::Idle;
        };
        if self.synced != Some(position) && !self.switch_block(position).await {
            return Step::Stop;
        }

        if self.item_index == 0
            && self.pending.is_empty()
            && self.connection.is_closing_at_block_boundary()
        {
            self.connection.close_now_at_block_boundary().await;
            return Step::Stop;
        }

        let Some(block) = self.block.clone() else {
            return Step::Idle;
        };

        let index_before = self.item_index;
        if !self.drain(&block).await {
            return Step::Stop;
        }
        if Some(self.connection.stream_position()) != self.synced {
            return Step::Progressed;
        }
        if !self.maybe_send_pending(&block).await {
            return Step::Stop;
        }
        match self.maybe_advance_block(&block).await {
            Some(true) => Step::Progressed,
            None => Step::Stop,
            Some(false) if self.sent || self.item_index != index_before => Step::Progressed,
            Some(false) => Step::Idle,
        }
    }

    /// Current stream position, choosing a starting block if none is set.
    fn resolve_position(&self) -> Option<StreamPosition> {
        let connection = &self.connection;
        if connection.streaming_block_number().is_none() {
            let buffer = &connection.context.buffer;
            let earliest = buffer.earliest_available_block_number()?;
            let start = buffer
                .highest_acked_block_number()
                .map(|acked| acked.saturating_add(1))
                .filter(|next| *next >= earliest)
                .unwrap_or(earliest);
            if connection.start_streaming_at(start) {
                info!(connection = %connection, start, "Starting to stream");
            }
        }
        Some(connection.stream_position())
    }

    /// Restarts the worker on the block at `position`. Returns `false` if
    /// the connection had to end the stream.
    async fn switch_block(&mut self, position: StreamPosition) -> bool {
        let Some(block_number) = position.block else {
            return true;
        };
        let buffer = &self.connection.context.buffer;
        self.block = buffer.get_block_state(block_number);
        self.item_index = 0;
        self.pending = PendingRequest::new(block_number, &self.connection.budget);
        self.last_send = Instant::now();

        if self.block.is_some() {
            self.synced = Some(position);
            debug!(connection = %self.connection, block_number, "Worker switched block");
            return true;
        }

        let earliest = buffer.earliest_available_block_number();
        if earliest.is_some_and(|earliest| block_number < earliest) {
            warn!(
                connection = %self.connection,
                block_number,
                ?earliest,
                "Block was released before it could be streamed, peer is too far behind"
            );
            self.connection
                .end_stream_and_reschedule(EndStreamCode::TooFarBehind)
                .await;
            return false;
        }
        // Not produced yet; look again next round.
        true
    }

    /// Batches every available item of `block`. Returns `false` once the
    /// worker must stop.
    async fn drain(&mut self, block: &Arc<BlockState>) -> bool {
        let budget = self.connection.budget;
        while let Some(item) = block.item(self.item_index) {
            if !self.should_run() {
                return false;
            }
            if Some(self.connection.stream_position()) != self.synced {
                return true;
            }

            let estimate = budget.estimate_item(&item);
            match place_item(
                self.pending.estimated_bytes(),
                self.pending.len(),
                estimate,
                &budget,
            ) {
                ItemPlacement::Append => {
                    let is_proof = item.is_proof();
                    self.pending.push(item, estimate);
                    self.item_index += 1;
                    if is_proof && !self.try_send_pending().await {
                        return false;
                    }
                }
                ItemPlacement::FlushFirst => {
                    if !self.try_send_pending().await {
                        return false;
                    }
                }
                ItemPlacement::SendAlone => {
                    if !self.pending.is_empty() {
                        if !self.try_send_pending().await {
                            return false;
                        }
                        continue;
                    }
                    self.pending.push(item, estimate);
                    self.item_index += 1;
                    if !self.try_send_pending().await {
                        return false;
                    }
                }
                ItemPlacement::ExceedsHardLimit => {
                    error!(
                        connection = %self.connection,
                        block_number = block.block_number(),
                        item_index = self.item_index,
                        size = item.size(),
                        hard_limit = budget.hard_limit_bytes,
                        "Block item exceeds the hard request limit and can never be sent"
                    );
                    if !self.pending.is_empty() && !self.try_send_pending().await {
                        return false;
                    }
                    self.connection
                        .context
                        .metrics
                        .record_request_exceeds_hard_limit();
                    self.connection
                        .end_stream_unrecoverable(EndStreamCode::Error)
                        .await;
                    return false;
                }
            }
        }
        true
    }

    /// Sends the pending request, deferring trailing items while the encoded
    /// request is over the soft limit.
    async fn try_send_pending(&mut self) -> bool {
        let budget = self.connection.budget;
        while !self.pending.is_empty() {
            let request = self.pending.to_request();
            let actual = request.encoded_len();
            match check_request_size(actual, self.pending.len(), &budget) {
                SizeCheck::TrimLast => {
                    self.pending.pop_last(&budget);
                    self.item_index -= 1;
                    self.connection
                        .context
                        .metrics
                        .record_multi_item_request_exceeds_soft_limit();
                    debug!(
                        connection = %self.connection,
                        actual,
                        soft_limit = budget.soft_limit_bytes,
                        "Encoded request over the soft limit, deferring last item"
                    );
                }
                SizeCheck::ExceedsHardLimit => {
                    error!(
                        connection = %self.connection,
                        actual,
                        hard_limit = budget.hard_limit_bytes,
                        "Encoded request exceeds the hard limit"
                    );
                    self.connection
                        .context
                        .metrics
                        .record_request_exceeds_hard_limit();
                    self.connection
                        .end_stream_unrecoverable(EndStreamCode::Error)
                        .await;
                    return false;
                }
                SizeCheck::WithinLimits => {
                    let block_number = self.pending.block_number();
                    let contains_proof = self.pending.contains_proof();
                    if self.connection.send_request(request).await.is_err() {
                        return false;
                    }
                    if contains_proof {
                        let node = &self.connection.node;
                        self.connection.with_coordinator(|coordinator, _| {
                            coordinator.record_block_proof_sent(node, block_number, Instant::now())
                        });
                    }
                    self.pending.clear();
                    self.last_send = Instant::now();
                    self.sent = true;
                    return true;
                }
            }
        }
        true
    }

    /// Flushes a partial request once the block is drained or the request
    /// has waited long enough.
    async fn maybe_send_pending(&mut self, block: &BlockState) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let drained = block.is_closed() && self.item_index >= block.item_count();
        if drained || self.last_send.elapsed() >= self.connection.config.max_request_delay {
            return self.try_send_pending().await;
        }
        true
    }

    /// Ends a fully sent block. `Some(true)` if the worker moved on,
    /// `Some(false)` if the block is not complete, `None` to stop.
    async fn maybe_advance_block(&mut self, block: &BlockState) -> Option<bool> {
        let complete = block.is_closed()
            && self.item_index >= block.item_count()
            && self.pending.is_empty();
        if !complete || Some(self.connection.stream_position()) != self.synced {
            return Some(false);
        }

        let block_number = block.block_number();
        let next = block_number.saturating_add(1);
        self.connection
            .send_request(PublishStreamRequest::EndOfBlock { block_number })
            .await
            .ok()?;
        trace!(connection = %self.connection, block_number, "Block fully sent");

        if !self.connection.advance_streaming(block_number, next) {
            debug!(connection = %self.connection, block_number, "Streaming position moved concurrently");
        }
        if self.connection.is_closing_at_block_boundary() {
            self.connection.close_now_at_block_boundary().await;
            return None;
        }
        Some(true)
    }
}
