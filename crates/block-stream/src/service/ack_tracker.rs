//! # Acknowledgement Tracker
//!
//! Releases buffered blocks once a quorum of distinct peers has verified them.
//!
//! A peer verifying block `n` implies it verified every block below `n`, so
//! the tracker only keeps each peer's highest verified block. The quorum
//! block is the Q-th highest of those values. Every acknowledgement releases
//! the blocks the buffer still retains at or below the quorum block, so a
//! block opened after the quorum already passed it is released by the next
//! acknowledgement. Release work is proportional to the retained blocks, not
//! to the distance the quorum moved.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ports::outbound::CleanupSink;

#[derive(Debug, Default)]
struct TrackerState {
    verified: HashMap<String, u64>,
    released_through: Option<u64>,
}

/// Quorum-based release of buffered blocks.
pub struct AcknowledgementTracker {
    quorum: usize,
    state: Mutex<TrackerState>,
    sink: Arc<dyn CleanupSink>,
}

impl AcknowledgementTracker {
    /// A quorum of zero is treated as one.
    pub fn new(quorum: usize, sink: Arc<dyn CleanupSink>) -> Self {
        Self {
            quorum: quorum.max(1),
            state: Mutex::new(TrackerState::default()),
            sink,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Records that `peer` verified every block up to `block_number`.
    ///
    /// Returns the blocks released by this call, in ascending order.
    pub fn on_acknowledgement(&self, peer: &str, block_number: u64) -> Vec<u64> {
        // Held while releasing so that concurrent callers never see the same
        // retained block.
        let mut state = self.state.lock();
        let verified = state.verified.entry(peer.to_string()).or_insert(block_number);
        if block_number > *verified {
            *verified = block_number;
        }

        let Some(quorum_block) = Self::quorum_block(&state.verified, self.quorum) else {
            return Vec::new();
        };
        if state
            .released_through
            .map_or(true, |released| quorum_block > released)
        {
            state.released_through = Some(quorum_block);
        }

        let released = self.sink.retained_blocks_through(quorum_block);
        if released.is_empty() {
            return released;
        }
        info!(
            from = ?released.first(),
            through = ?released.last(),
            count = released.len(),
            quorum = self.quorum,
            "Quorum reached, releasing blocks"
        );
        for block_number in &released {
            self.sink.on_block_ready_for_cleanup(*block_number);
        }
        released
    }

    /// Highest block `peer` has verified.
    pub fn last_verified_block(&self, peer: &str) -> Option<u64> {
        self.state.lock().verified.get(peer).copied()
    }

    /// Highest block released so far.
    pub fn released_through(&self) -> Option<u64> {
        self.state.lock().released_through
    }

    /// Forgets a peer that is no longer configured.
    pub fn remove_peer(&self, peer: &str) {
        if self.state.lock().verified.remove(peer).is_some() {
            debug!(peer, "Removed peer from acknowledgement tracking");
        }
    }

    fn quorum_block(verified: &HashMap<String, u64>, quorum: usize) -> Option<u64> {
        if verified.len() < quorum {
            return None;
        }
        let mut highest: Vec<u64> = verified.values().copied().collect();
        highest.sort_unstable_by(|a, b| b.cmp(a));
        highest.get(quorum - 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::NoopStreamMetrics;
    use crate::domain::BlockBufferConfig;
    use crate::ports::inbound::BlockBufferApi;
    use crate::service::BlockBufferService;
    use std::collections::{BTreeMap, BTreeSet};
    use std::ops::RangeInclusive;
    use std::time::{Duration, Instant};

    /// Retains a fixed set of blocks and records how often each was released.
    #[derive(Default)]
    struct CountingSink {
        retained: Mutex<BTreeSet<u64>>,
        released: Mutex<BTreeMap<u64, usize>>,
    }

    impl CountingSink {
        fn with_blocks(blocks: RangeInclusive<u64>) -> Self {
            Self {
                retained: Mutex::new(blocks.collect()),
                ..Self::default()
            }
        }

        fn count(&self, block_number: u64) -> usize {
            self.released.lock().get(&block_number).copied().unwrap_or(0)
        }
    }

    impl CleanupSink for CountingSink {
        fn on_block_ready_for_cleanup(&self, block_number: u64) {
            self.retained.lock().remove(&block_number);
            *self.released.lock().entry(block_number).or_insert(0) += 1;
        }

        fn retained_blocks_through(&self, block_number: u64) -> Vec<u64> {
            self.retained.lock().range(..=block_number).copied().collect()
        }
    }

    fn buffer_sink() -> Arc<BlockBufferService> {
        Arc::new(BlockBufferService::new(
            BlockBufferConfig {
                max_buffered_blocks: 1_000,
                ..BlockBufferConfig::default()
            },
            Arc::new(NoopStreamMetrics),
        ))
    }

    #[test]
    fn test_cleanup_fires_once_after_second_peer() {
        let sink = Arc::new(CountingSink::with_blocks(1..=1));
        let tracker = AcknowledgementTracker::new(2, sink.clone());

        assert!(tracker.on_acknowledgement("A", 1).is_empty());
        assert_eq!(sink.count(1), 0);

        assert_eq!(tracker.on_acknowledgement("B", 1), vec![1]);
        assert_eq!(sink.count(1), 1);

        assert!(tracker.on_acknowledgement("C", 1).is_empty());
        assert_eq!(sink.count(1), 1);

        for peer in ["A", "B", "C"] {
            assert_eq!(tracker.last_verified_block(peer), Some(1));
        }
    }

    #[test]
    fn test_same_peer_never_counts_twice() {
        let sink = Arc::new(CountingSink::with_blocks(1..=6));
        let tracker = AcknowledgementTracker::new(2, sink.clone());

        tracker.on_acknowledgement("A", 4);
        tracker.on_acknowledgement("A", 5);
        tracker.on_acknowledgement("A", 6);

        assert_eq!(tracker.released_through(), None);
        assert_eq!(tracker.last_verified_block("A"), Some(6));
        assert_eq!(sink.count(4), 0);
    }

    #[test]
    fn test_higher_ack_counts_for_lower_blocks() {
        let sink = Arc::new(CountingSink::with_blocks(1..=5));
        let tracker = AcknowledgementTracker::new(2, sink.clone());

        tracker.on_acknowledgement("A", 5);
        let released = tracker.on_acknowledgement("B", 3);

        assert_eq!(released, vec![1, 2, 3]);
        for block in 1..=3 {
            assert_eq!(sink.count(block), 1);
        }
        assert_eq!(sink.count(4), 0);

        assert_eq!(tracker.on_acknowledgement("B", 5), vec![4, 5]);
    }

    #[test]
    fn test_acks_at_or_below_released_block_are_bookkeeping_only() {
        let sink = Arc::new(CountingSink::with_blocks(10..=10));
        let tracker = AcknowledgementTracker::new(1, sink.clone());

        assert_eq!(tracker.on_acknowledgement("A", 10), vec![10]);
        assert!(tracker.on_acknowledgement("B", 7).is_empty());
        assert!(tracker.on_acknowledgement("B", 10).is_empty());

        assert_eq!(tracker.last_verified_block("B"), Some(10));
        assert_eq!(sink.count(10), 1);
        assert_eq!(sink.count(7), 0);
    }

    #[test]
    fn test_blocks_opened_below_watermark_released_on_next_ack() {
        let buffer = buffer_sink();
        let tracker = AcknowledgementTracker::new(1, buffer.clone());
        buffer.open_block(10);

        // Peer reports a block that has not been produced yet.
        assert_eq!(tracker.on_acknowledgement("A", 20), vec![10]);
        assert_eq!(tracker.released_through(), Some(20));

        for block in 11..=20 {
            buffer.open_block(block);
        }
        assert_eq!(buffer.buffered_block_count(), 10);

        let released = tracker.on_acknowledgement("A", 21);
        assert_eq!(released, (11..=20).collect::<Vec<_>>());
        assert_eq!(buffer.buffered_block_count(), 0);
        assert_eq!(tracker.released_through(), Some(21));
    }

    #[test]
    fn test_stale_ack_still_releases_late_blocks() {
        let buffer = buffer_sink();
        let tracker = AcknowledgementTracker::new(1, buffer.clone());

        assert!(tracker.on_acknowledgement("A", 20).is_empty());
        buffer.open_block(15);

        assert_eq!(tracker.on_acknowledgement("A", 20), vec![15]);
        assert!(buffer.get_block_state(15).is_none());
    }

    #[test]
    fn test_far_ahead_ack_releases_only_buffered_blocks() {
        let buffer = buffer_sink();
        let tracker = AcknowledgementTracker::new(1, buffer.clone());
        buffer.open_block(0);

        let started = Instant::now();
        let released = tracker.on_acknowledgement("A", 50_000_000);

        assert_eq!(released, vec![0]);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(tracker.released_through(), Some(50_000_000));
        assert_eq!(buffer.buffered_block_count(), 0);
    }

    #[test]
    fn test_concurrent_acknowledgements_release_each_block_once() {
        const PEERS: usize = 5;
        const BLOCKS: u64 = 200;

        for _ in 0..10 {
            let sink = Arc::new(CountingSink::with_blocks(1..=BLOCKS));
            let tracker = Arc::new(AcknowledgementTracker::new(3, sink.clone()));

            let handles: Vec<_> = (0..PEERS)
                .map(|peer| {
                    let tracker = Arc::clone(&tracker);
                    std::thread::spawn(move || {
                        let name = format!("peer-{peer}");
                        for block in 1..=BLOCKS {
                            tracker.on_acknowledgement(&name, block);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            for block in 1..=BLOCKS {
                assert_eq!(sink.count(block), 1, "block {block} released wrong number of times");
            }
            assert_eq!(tracker.released_through(), Some(BLOCKS));
        }
    }
}
