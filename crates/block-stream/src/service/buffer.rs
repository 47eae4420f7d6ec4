//! # Block Buffer Service
//!
//! Shared store of in-flight blocks, indexed by block number.
//!
//! The producer opens blocks, appends items and closes them; connection
//! workers only read. Blocks leave the buffer solely through
//! [`BlockBufferService::clean_up_block_state`], which the acknowledgement
//! tracker calls once a quorum of peers has verified them.
//!
//! ## Saturation
//!
//! - **Action stage**: fill level at or above `action_stage_threshold`. The
//!   registered [`BufferPressureHandler`] is asked to move streaming to
//!   another peer, at most once per `action_grace_period`.
//! - **Saturated**: buffer full. Backpressure holds the producer until the
//!   fill level drops to `recovery_threshold`.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::domain::{BlockBufferConfig, BlockItem, BlockState, SaturationStage};
use crate::ports::inbound::BlockBufferApi;
use crate::ports::outbound::{BufferPressureHandler, CleanupSink, StreamMetrics};

#[derive(Debug, Default)]
struct BufferCounters {
    last_produced: Option<u64>,
    highest_acked: Option<u64>,
    current: Option<u64>,
}

#[derive(Debug, Default)]
struct PressureState {
    stage: SaturationStage,
    backpressure: bool,
    last_action: Option<Instant>,
}

/// Block buffer shared by the producer, the connection workers and the
/// acknowledgement tracker.
pub struct BlockBufferService {
    config: BlockBufferConfig,
    blocks: RwLock<BTreeMap<u64, Arc<BlockState>>>,
    counters: Mutex<BufferCounters>,
    capacity: Notify,
    pressure: Mutex<PressureState>,
    pressure_handler: RwLock<Option<Weak<dyn BufferPressureHandler>>>,
    metrics: Arc<dyn StreamMetrics>,
}

impl BlockBufferService {
    pub fn new(config: BlockBufferConfig, metrics: Arc<dyn StreamMetrics>) -> Self {
        Self {
            config,
            blocks: RwLock::new(BTreeMap::new()),
            counters: Mutex::new(BufferCounters::default()),
            capacity: Notify::new(),
            pressure: Mutex::new(PressureState::default()),
            pressure_handler: RwLock::new(None),
            metrics,
        }
    }

    /// Registers the component notified when the buffer reaches the action
    /// stage. Held weakly.
    pub fn set_pressure_handler(&self, handler: Weak<dyn BufferPressureHandler>) {
        *self.pressure_handler.write() = Some(handler);
    }

    /// Block most recently opened.
    pub fn current_block_number(&self) -> Option<u64> {
        self.counters.lock().current
    }

    /// Raises the highest acknowledged block. Lower values are ignored.
    pub fn set_latest_acknowledged_block(&self, block_number: u64) {
        let mut counters = self.counters.lock();
        if counters.highest_acked.map_or(true, |acked| block_number > acked) {
            counters.highest_acked = Some(block_number);
            drop(counters);
            self.metrics.record_latest_block_acked(block_number);
        }
    }

    /// Releases block `block_number`. Repeated calls are no-ops.
    pub fn clean_up_block_state(&self, block_number: u64) {
        let removed = self.blocks.write().remove(&block_number);
        if removed.is_some() {
            trace!(block_number, "Released block from buffer");
            self.metrics.record_blocks_cleaned(1);
            self.handle_saturation_change();
            self.capacity.notify_waiters();
        }
    }

    pub fn buffered_block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_saturated(&self) -> bool {
        self.buffered_block_count() >= self.config.max_buffered_blocks
    }

    /// Buffer fill level in percent of `max_buffered_blocks`.
    pub fn saturation_percent(&self) -> f64 {
        self.config.saturation_percent(self.buffered_block_count())
    }

    pub fn saturation_stage(&self) -> SaturationStage {
        self.pressure.lock().stage
    }

    /// Whether the producer is currently held back.
    pub fn is_backpressure_enabled(&self) -> bool {
        self.pressure.lock().backpressure
    }

    /// Waits until backpressure is lifted and the buffer has room for
    /// another block.
    ///
    /// Never evicts; room is only made by quorum cleanup.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_backpressure_enabled() && !self.is_saturated() {
                return;
            }
            debug!(
                buffered = self.buffered_block_count(),
                max = self.config.max_buffered_blocks,
                "Block buffer saturated, waiting for acknowledgements"
            );
            notified.await;
        }
    }

    /// Re-evaluates the saturation stage after the block count changed.
    fn handle_saturation_change(&self) {
        let (percent, switch, recovered) = {
            let mut pressure = self.pressure.lock();
            let buffered = self.buffered_block_count();
            let percent = self.config.saturation_percent(buffered);
            let stage = self.config.stage_for(buffered);
            if stage != pressure.stage {
                debug!(from = ?pressure.stage, to = ?stage, percent, "Buffer saturation stage changed");
                pressure.stage = stage;
            }

            let mut recovered = false;
            if stage == SaturationStage::Saturated {
                if !pressure.backpressure {
                    warn!(buffered, percent, "Block buffer saturated, enabling backpressure");
                }
                pressure.backpressure = true;
            } else if pressure.backpressure && percent <= self.config.recovery_threshold {
                info!(buffered, percent, "Block buffer recovered, disabling backpressure");
                pressure.backpressure = false;
                recovered = true;
            }

            let now = Instant::now();
            let grace_elapsed = pressure.last_action.map_or(true, |last| {
                now.saturating_duration_since(last) >= self.config.action_grace_period
            });
            let switch = stage != SaturationStage::Low && grace_elapsed;
            if switch {
                pressure.last_action = Some(now);
            }
            (percent, switch, recovered)
        };

        self.metrics.record_buffer_saturation(percent);
        if recovered {
            self.capacity.notify_waiters();
        }
        if switch {
            let handler = self.pressure_handler.read().as_ref().and_then(Weak::upgrade);
            if let Some(handler) = handler {
                info!(percent, "Block buffer at action stage, switching block node");
                handler.on_buffer_action_stage(percent);
            }
        }
    }
}

impl BlockBufferApi for BlockBufferService {
    fn open_block(&self, block_number: u64) {
        {
            let mut blocks = self.blocks.write();
            if let Some(existing) = blocks.get(&block_number) {
                if existing.is_closed() {
                    warn!(block_number, "Block already exists and is closed, ignoring open");
                } else {
                    debug!(block_number, "Block already open");
                }
                return;
            }
            blocks.insert(block_number, Arc::new(BlockState::new(block_number)));
        }

        {
            let mut counters = self.counters.lock();
            counters.current = Some(block_number);
            if counters
                .last_produced
                .map_or(true, |last| block_number > last)
            {
                counters.last_produced = Some(block_number);
            }
        }

        info!(block_number, "Opened block");
        self.metrics.record_block_opened(block_number);
        self.handle_saturation_change();
    }

    fn add_item(&self, block_number: u64, item: BlockItem) -> bool {
        let Some(block) = self.get_block_state(block_number) else {
            debug!(block_number, "Item for unknown or released block dropped");
            self.metrics.record_block_missing(block_number);
            return false;
        };
        if !block.add_item(item) {
            warn!(block_number, "Item for closed block dropped");
            return false;
        }
        true
    }

    fn close_block(&self, block_number: u64) {
        match self.get_block_state(block_number) {
            Some(block) => {
                if !block.has_proof() {
                    warn!(block_number, "Closing block without a proof item");
                }
                block.close();
                debug!(block_number, items = block.item_count(), "Closed block");
                self.metrics.record_block_closed(block_number);
            }
            None => {
                debug!(block_number, "Close for unknown or released block ignored");
                self.metrics.record_block_missing(block_number);
            }
        }
    }

    fn get_block_state(&self, block_number: u64) -> Option<Arc<BlockState>> {
        self.blocks.read().get(&block_number).cloned()
    }

    fn earliest_available_block_number(&self) -> Option<u64> {
        self.blocks.read().keys().next().copied()
    }

    fn highest_acked_block_number(&self) -> Option<u64> {
        self.counters.lock().highest_acked
    }

    fn last_block_number_produced(&self) -> Option<u64> {
        self.counters.lock().last_produced
    }
}

impl CleanupSink for BlockBufferService {
    fn on_block_ready_for_cleanup(&self, block_number: u64) {
        self.clean_up_block_state(block_number);
    }

    fn retained_blocks_through(&self, block_number: u64) -> Vec<u64> {
        self.blocks
            .read()
            .range(..=block_number)
            .map(|(block_number, _)| *block_number)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NoopStreamMetrics;
    use crate::domain::BlockItemKind;
    use std::time::Duration;

    fn buffer(max_buffered_blocks: usize) -> BlockBufferService {
        BlockBufferService::new(
            BlockBufferConfig {
                max_buffered_blocks,
                ..BlockBufferConfig::default()
            },
            Arc::new(NoopStreamMetrics),
        )
    }

    fn item(size: usize) -> BlockItem {
        BlockItem::with_size(BlockItemKind::TransactionItem, size)
    }

    #[test]
    fn test_items_returned_in_append_order() {
        let buffer = buffer(10);
        buffer.open_block(1);
        for size in [5, 3, 9, 1] {
            assert!(buffer.add_item(1, item(size)));
        }

        let state = buffer.get_block_state(1).unwrap();
        let sizes: Vec<usize> = state.items().iter().map(|i| i.size()).collect();
        assert_eq!(sizes, vec![5, 3, 9, 1]);
    }

    #[test]
    fn test_bookkeeping_counters() {
        let buffer = buffer(10);
        assert_eq!(buffer.earliest_available_block_number(), None);
        assert_eq!(buffer.last_block_number_produced(), None);
        assert_eq!(buffer.highest_acked_block_number(), None);

        buffer.open_block(5);
        buffer.open_block(6);
        buffer.open_block(7);

        assert_eq!(buffer.earliest_available_block_number(), Some(5));
        assert_eq!(buffer.last_block_number_produced(), Some(7));
        assert_eq!(buffer.current_block_number(), Some(7));

        buffer.set_latest_acknowledged_block(6);
        buffer.set_latest_acknowledged_block(4);
        assert_eq!(buffer.highest_acked_block_number(), Some(6));
    }

    #[test]
    fn test_add_item_to_missing_or_closed_block_is_noop() {
        let buffer = buffer(10);
        assert!(!buffer.add_item(3, item(1)));

        buffer.open_block(3);
        buffer.close_block(3);
        assert!(!buffer.add_item(3, item(1)));
        assert_eq!(buffer.get_block_state(3).unwrap().item_count(), 0);
    }

    #[test]
    fn test_reopening_closed_block_is_ignored() {
        let buffer = buffer(10);
        buffer.open_block(2);
        buffer.add_item(2, item(4));
        buffer.close_block(2);

        buffer.open_block(2);

        let state = buffer.get_block_state(2).unwrap();
        assert!(state.is_closed());
        assert_eq!(state.item_count(), 1);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let buffer = buffer(10);
        buffer.open_block(1);
        buffer.open_block(2);

        buffer.clean_up_block_state(1);
        buffer.clean_up_block_state(1);
        buffer.clean_up_block_state(99);

        assert!(buffer.get_block_state(1).is_none());
        assert_eq!(buffer.earliest_available_block_number(), Some(2));
        assert!(!buffer.add_item(1, item(1)));
    }

    #[test]
    fn test_saturation() {
        let buffer = buffer(2);
        buffer.open_block(1);
        assert!(!buffer.is_saturated());
        buffer.open_block(2);
        assert!(buffer.is_saturated());
        assert_eq!(buffer.saturation_percent(), 100.0);
    }

    #[tokio::test]
    async fn test_wait_for_capacity_resumes_after_cleanup() {
        let buffer = Arc::new(buffer(1));
        buffer.open_block(1);

        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_for_capacity().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        buffer.clean_up_block_state(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("producer should be released")
            .unwrap();
    }

    /// Counts action-stage notifications.
    #[derive(Default)]
    struct RecordingHandler {
        switches: Mutex<Vec<f64>>,
    }

    impl BufferPressureHandler for RecordingHandler {
        fn on_buffer_action_stage(&self, saturation_percent: f64) {
            self.switches.lock().push(saturation_percent);
        }
    }

    fn staged_buffer(grace: Duration) -> (BlockBufferService, Arc<RecordingHandler>) {
        let buffer = BlockBufferService::new(
            BlockBufferConfig {
                max_buffered_blocks: 10,
                action_stage_threshold: 50.0,
                action_grace_period: grace,
                recovery_threshold: 70.0,
            },
            Arc::new(NoopStreamMetrics),
        );
        let handler = Arc::new(RecordingHandler::default());
        let weak = Arc::downgrade(&handler);
        buffer.set_pressure_handler(weak);
        (buffer, handler)
    }

    #[test]
    fn test_action_stage_requests_switch_once_per_grace_period() {
        let (buffer, handler) = staged_buffer(Duration::from_secs(60));

        for block in 1..=4 {
            buffer.open_block(block);
        }
        assert_eq!(buffer.saturation_stage(), SaturationStage::Low);
        assert!(handler.switches.lock().is_empty());

        buffer.open_block(5);
        assert_eq!(buffer.saturation_stage(), SaturationStage::ActionStage);
        assert_eq!(*handler.switches.lock(), vec![50.0]);

        // Still inside the grace period.
        buffer.open_block(6);
        buffer.open_block(7);
        assert_eq!(handler.switches.lock().len(), 1);
    }

    #[test]
    fn test_action_stage_switches_again_after_grace_period() {
        let (buffer, handler) = staged_buffer(Duration::ZERO);

        buffer.open_block(1);
        assert!(handler.switches.lock().is_empty());
        for block in 2..=6 {
            buffer.open_block(block);
        }

        assert_eq!(*handler.switches.lock(), vec![50.0, 60.0]);
    }

    #[test]
    fn test_backpressure_lifted_only_at_recovery_threshold() {
        let (buffer, _handler) = staged_buffer(Duration::from_secs(60));
        for block in 1..=10 {
            buffer.open_block(block);
        }
        assert_eq!(buffer.saturation_stage(), SaturationStage::Saturated);
        assert!(buffer.is_backpressure_enabled());

        // 90% and 80% are below capacity but above the recovery threshold.
        buffer.clean_up_block_state(1);
        assert!(buffer.is_backpressure_enabled());
        buffer.clean_up_block_state(2);
        assert!(buffer.is_backpressure_enabled());
        assert!(!buffer.is_saturated());

        buffer.clean_up_block_state(3);
        assert!(!buffer.is_backpressure_enabled());
        assert_eq!(buffer.saturation_stage(), SaturationStage::ActionStage);
    }

    #[tokio::test]
    async fn test_producer_held_until_recovery() {
        let (buffer, _handler) = staged_buffer(Duration::from_secs(60));
        let buffer = Arc::new(buffer);
        for block in 1..=10 {
            buffer.open_block(block);
        }

        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_for_capacity().await })
        };

        buffer.clean_up_block_state(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        buffer.clean_up_block_state(2);
        buffer.clean_up_block_state(3);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("producer should be released")
            .unwrap();
    }

    #[test]
    fn test_dropped_handler_is_ignored() {
        let (buffer, handler) = staged_buffer(Duration::ZERO);
        drop(handler);
        for block in 1..=10 {
            buffer.open_block(block);
        }
        assert!(buffer.is_backpressure_enabled());
    }
}
