//! Value objects for block streaming configuration and per-peer state.

use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// First retry delay of the exponential backoff.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Growth factor of the exponential backoff.
pub const RETRY_BACKOFF_MULTIPLIER: u32 = 2;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Connection behaviour configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockNodeConnectionConfig {
    /// Period after which an active stream is reset.
    pub stream_reset_period: Duration,
    /// Budget for a single send/close on the pipeline.
    pub pipeline_operation_timeout: Duration,
    /// Budget for opening a stream or querying peer status.
    pub connection_timeout: Duration,
    /// Worker sleep while waiting for items or blocks.
    pub worker_loop_sleep: Duration,
    /// A partially filled request is sent after this long.
    pub max_request_delay: Duration,
    /// Base estimate of an empty request.
    pub request_padding_bytes: usize,
    /// Per-item estimate padding.
    pub item_padding_bytes: usize,
    /// EndOfStream responses tolerated per time frame.
    pub max_end_of_streams_allowed: usize,
    /// Window of the EndOfStream rate limit.
    pub end_of_stream_time_frame: Duration,
    /// Backoff applied when the EndOfStream rate limit is exceeded.
    pub end_of_stream_schedule_delay: Duration,
    /// Proof-to-acknowledgement latency considered high.
    pub high_latency_threshold: Duration,
    /// Consecutive high-latency acknowledgements before switching peers.
    pub high_latency_events_before_switching: u32,
    /// Upper bound of the exponential backoff.
    pub max_backoff_delay: Duration,
    /// Retry attempts reset after this long without a retry.
    pub backoff_reset_time_frame: Duration,
    /// Delay before retrying a peer that lost a forced switch.
    pub forced_switch_reschedule_delay: Duration,
    /// Fixed backoff after transient peer failures.
    pub failure_reschedule_delay: Duration,
    /// Distinct peers that must verify a block before it is released.
    pub quorum_threshold: usize,
}

impl Default for BlockNodeConnectionConfig {
    fn default() -> Self {
        Self {
            stream_reset_period: Duration::from_secs(24 * 60 * 60),
            pipeline_operation_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(2),
            worker_loop_sleep: Duration::from_millis(10),
            max_request_delay: Duration::from_millis(100),
            request_padding_bytes: 0,
            item_padding_bytes: 0,
            max_end_of_streams_allowed: 5,
            end_of_stream_time_frame: Duration::from_secs(30),
            end_of_stream_schedule_delay: Duration::from_secs(5 * 60),
            high_latency_threshold: Duration::from_secs(30),
            high_latency_events_before_switching: 5,
            max_backoff_delay: Duration::from_secs(10),
            backoff_reset_time_frame: Duration::from_secs(30),
            forced_switch_reschedule_delay: Duration::from_secs(180),
            failure_reschedule_delay: Duration::from_secs(30),
            quorum_threshold: 1,
        }
    }
}

impl BlockNodeConnectionConfig {
    /// Fast timers for tests.
    pub fn for_testing() -> Self {
        Self {
            pipeline_operation_timeout: Duration::from_millis(200),
            connection_timeout: Duration::from_millis(200),
            worker_loop_sleep: Duration::from_millis(1),
            max_request_delay: Duration::from_millis(20),
            failure_reschedule_delay: Duration::from_millis(50),
            end_of_stream_schedule_delay: Duration::from_millis(500),
            max_backoff_delay: Duration::from_millis(100),
            forced_switch_reschedule_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

/// Block buffer configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockBufferConfig {
    /// Buffered (not yet released) blocks at which the producer is held back.
    pub max_buffered_blocks: usize,
    /// Saturation percent at which streaming is moved to another peer.
    pub action_stage_threshold: f64,
    /// Minimum time between two saturation-driven peer switches.
    pub action_grace_period: Duration,
    /// Saturation percent at or below which backpressure is lifted again.
    pub recovery_threshold: f64,
}

impl BlockBufferConfig {
    /// Fill level of `buffered` blocks in percent of `max_buffered_blocks`.
    pub fn saturation_percent(&self, buffered: usize) -> f64 {
        if self.max_buffered_blocks == 0 {
            return 100.0;
        }
        buffered as f64 * 100.0 / self.max_buffered_blocks as f64
    }

    pub fn stage_for(&self, buffered: usize) -> SaturationStage {
        if buffered >= self.max_buffered_blocks {
            SaturationStage::Saturated
        } else if self.saturation_percent(buffered) >= self.action_stage_threshold {
            SaturationStage::ActionStage
        } else {
            SaturationStage::Low
        }
    }
}

impl Default for BlockBufferConfig {
    fn default() -> Self {
        Self {
            max_buffered_blocks: 150,
            action_stage_threshold: 50.0,
            action_grace_period: Duration::from_secs(20),
            recovery_threshold: 85.0,
        }
    }
}

/// Buffer fill band.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SaturationStage {
    #[default]
    Low,
    /// Above the action threshold but still accepting blocks.
    ActionStage,
    /// At capacity.
    Saturated,
}

// =============================================================================
// PER-PEER STATISTICS
// =============================================================================

/// Outcome of recording an acknowledgement against the proof send time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HighLatencyResult {
    /// Proof-sent to acknowledgement latency, if the proof send was recorded.
    pub latency: Option<Duration>,
    pub consecutive_high_latency_events: u32,
    pub is_high_latency: bool,
    pub should_switch: bool,
}

/// Rolling latency and error history of one peer.
#[derive(Clone, Debug, Default)]
pub struct PeerStats {
    end_of_stream_timestamps: VecDeque<Instant>,
    proof_sent: BTreeMap<u64, Instant>,
    consecutive_high_latency_events: u32,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an EndOfStream at `now` and returns `true` if more than
    /// `max_allowed` occurred within `window`.
    pub fn add_end_of_stream_and_check_limit(
        &mut self,
        now: Instant,
        max_allowed: usize,
        window: Duration,
    ) -> bool {
        self.end_of_stream_timestamps.push_back(now);
        while let Some(oldest) = self.end_of_stream_timestamps.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.end_of_stream_timestamps.pop_front();
            } else {
                break;
            }
        }
        self.end_of_stream_timestamps.len() > max_allowed
    }

    pub fn end_of_stream_count(&self) -> usize {
        self.end_of_stream_timestamps.len()
    }

    pub fn record_block_proof_sent(&mut self, block_number: u64, at: Instant) {
        self.proof_sent.entry(block_number).or_insert(at);
    }

    /// Measures the latency of an acknowledgement for `block_number`.
    ///
    /// Proof send times at or below the acknowledged block are dropped.
    pub fn record_acknowledgement_and_evaluate(
        &mut self,
        block_number: u64,
        at: Instant,
        threshold: Duration,
        events_before_switching: u32,
    ) -> HighLatencyResult {
        let latency = self
            .proof_sent
            .get(&block_number)
            .map(|sent| at.saturating_duration_since(*sent));

        self.proof_sent = match block_number.checked_add(1) {
            Some(next) => self.proof_sent.split_off(&next),
            None => BTreeMap::new(),
        };

        let Some(latency) = latency else {
            return HighLatencyResult {
                consecutive_high_latency_events: self.consecutive_high_latency_events,
                ..HighLatencyResult::default()
            };
        };

        let is_high_latency = latency > threshold;
        if is_high_latency {
            self.consecutive_high_latency_events += 1;
        } else {
            self.consecutive_high_latency_events = 0;
        }

        let consecutive = self.consecutive_high_latency_events;
        let should_switch = is_high_latency && consecutive >= events_before_switching;
        if should_switch {
            self.consecutive_high_latency_events = 0;
        }

        HighLatencyResult {
            latency: Some(latency),
            consecutive_high_latency_events: consecutive,
            is_high_latency,
            should_switch,
        }
    }
}

// =============================================================================
// RETRY STATE
// =============================================================================

/// Exponential backoff bookkeeping for one peer.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records an attempt at `now` and returns the attempt index used for
    /// the delay (0 for the first attempt in a fresh window).
    pub fn record_attempt(&mut self, now: Instant, reset_after: Duration) -> u32 {
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) > reset_after {
                self.attempts = 0;
            }
        }
        self.last_attempt = Some(now);
        let attempt = self.attempts;
        self.attempts = self.attempts.saturating_add(1);
        attempt
    }
}

/// Un-jittered backoff delay for `attempt`, capped at `max_delay`.
pub fn backoff_delay(attempt: u32, max_delay: Duration) -> Duration {
    let factor = RETRY_BACKOFF_MULTIPLIER
        .checked_pow(attempt)
        .unwrap_or(u32::MAX);
    INITIAL_RETRY_DELAY
        .checked_mul(factor)
        .unwrap_or(max_delay)
        .min(max_delay)
}

/// Applies jitter uniformly in `[delay/2, delay]`.
pub fn jittered<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let millis = delay.as_millis() as u64;
    let half = millis / 2;
    Duration::from_millis(half + rng.gen_range(0..=half))
}
